use futures::future::BoxFuture;
use serde::Deserialize;

use flowrun_core::error::Result;
use flowrun_core::types::Node;

use super::{parse_config, NodeContext, NodeExecutor, NodeOutput, NodeResult};

pub const TAG: &str = "notes";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum NotesMode {
    #[default]
    Transform,
    Passthrough,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NotesConfig {
    mode: NotesMode,
    content: String,
}

/// Static text, either emitted (with variables resolved) or ignored in
/// favour of the node's input.
pub struct NotesExecutor;

impl NodeExecutor for NotesExecutor {
    fn validate(&self, node: &Node) -> Result<()> {
        parse_config::<NotesConfig>(node).map(|_| ())
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: NotesConfig = parse_config(&ctx.node)?;
            Ok(match config.mode {
                NotesMode::Transform => NodeOutput::text(ctx.resolve(&config.content)),
                NotesMode::Passthrough => NodeOutput::new(ctx.input_value.clone()),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::{context, context_with};
    use serde_json::json;

    #[tokio::test]
    async fn transform_resolves_content() {
        let node = Node::new("n", TAG).with_config(json!({"content": "Hi {{who}} / {{input}}"}));
        let ctx = context_with(node, json!("in"), &[("who", json!("Ada"))]);
        let out = NotesExecutor.execute(&ctx).await.unwrap();
        assert_eq!(out.output, json!("Hi Ada / in"));
    }

    #[tokio::test]
    async fn passthrough_forwards_input_value() {
        let node = Node::new("n", TAG).with_config(json!({"mode": "passthrough", "content": "ignored"}));
        let ctx = context(node, json!({"k": 1}));
        let out = NotesExecutor.execute(&ctx).await.unwrap();
        assert_eq!(out.output, json!({"k": 1}));
    }

    #[test]
    fn unknown_mode_is_config_error() {
        let node = Node::new("n", TAG).with_config(json!({"mode": "shout"}));
        assert!(NotesExecutor.validate(&node).is_err());
    }
}
