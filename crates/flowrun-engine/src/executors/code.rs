use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::CodeSandbox;
use flowrun_core::types::{Node, NodeStatus, SandboxOutcome};

use super::{parse_config, top_level_fields, NodeContext, NodeExecutor, NodeOutput, NodeResult};

pub const TAG: &str = "code-run";

fn default_language() -> String { "javascript".to_string() }

#[derive(Debug, Deserialize)]
struct CodeConfig {
    #[serde(default)]
    code: String,
    #[serde(default = "default_language")]
    language: String,
}

/// Runs a user snippet in the sandbox collaborator.
pub struct CodeRunExecutor {
    sandbox: Arc<dyn CodeSandbox>,
}

impl CodeRunExecutor {
    pub fn new(sandbox: Arc<dyn CodeSandbox>) -> Self {
        Self { sandbox }
    }
}

/// Read-only context handed to the snippet: `input` plus every successful
/// result so far, keyed by node id and by label.
fn snippet_context(ctx: &NodeContext) -> Value {
    let mut context = Map::new();
    context.insert("input".into(), ctx.input_value.clone());

    let mut done: Vec<_> = ctx
        .results()
        .values()
        .filter(|r| r.status == NodeStatus::Success)
        .collect();
    done.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    for result in done {
        context.insert(result.node_id.clone(), result.output.clone());
    }
    for (label, id) in &ctx.scope.aliases {
        if let Some(r) = ctx.results().get(id).filter(|r| r.status == NodeStatus::Success) {
            context.entry(label.clone()).or_insert_with(|| r.output.clone());
        }
    }
    Value::Object(context)
}

impl NodeExecutor for CodeRunExecutor {
    fn validate(&self, node: &Node) -> Result<()> {
        let config: CodeConfig = parse_config(node)?;
        if config.code.trim().is_empty() {
            return Err(FlowError::config(&node.id, "code is empty"));
        }
        Ok(())
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: CodeConfig = parse_config(&ctx.node)?;
            let context = snippet_context(ctx);
            debug!(node_id = %ctx.node.id, language = %config.language, "Running snippet");

            let outcome = tokio::select! {
                outcome = self.sandbox.run(&config.code, context, &config.language) => outcome,
                _ = ctx.cancel.cancelled() => return Err(FlowError::Cancelled.into()),
            };

            match outcome {
                Ok(SandboxOutcome::Value(value)) => {
                    let fields = top_level_fields(&value);
                    let mut out = NodeOutput::new(value);
                    out.fields = fields;
                    Ok(out)
                }
                Ok(SandboxOutcome::Error(message)) => Err(FlowError::Snippet(message).into()),
                Err(e @ FlowError::Sandbox(_)) | Err(e @ FlowError::Cancelled) => Err(e.into()),
                Err(other) => Err(FlowError::Sandbox(other.to_string()).into()),
            }
        })
    }
}
