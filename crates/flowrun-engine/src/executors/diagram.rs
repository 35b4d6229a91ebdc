use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::DiagramRenderer;
use flowrun_core::types::Node;

use super::{parse_config, NodeContext, NodeExecutor, NodeOutput, NodeResult};

pub const TAG: &str = "diagram";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Operation {
    #[default]
    Render,
    Validate,
    Detect,
}

fn default_format() -> String { "svg".to_string() }

#[derive(Debug, Deserialize)]
struct DiagramConfig {
    #[serde(default)]
    source: String,
    #[serde(default)]
    operation: Operation,
    #[serde(default = "default_format")]
    format: String,
    #[serde(default)]
    theme: Option<Value>,
}

pub struct DiagramExecutor {
    renderer: Arc<dyn DiagramRenderer>,
}

impl DiagramExecutor {
    pub fn new(renderer: Arc<dyn DiagramRenderer>) -> Self {
        Self { renderer }
    }

    async fn perform(&self, config: &DiagramConfig, source: &str) -> Result<NodeOutput> {
        match config.operation {
            Operation::Render => {
                let markup = self
                    .renderer
                    .render(source, &config.format, config.theme.clone())
                    .await?;
                Ok(NodeOutput::text(markup))
            }
            Operation::Validate => {
                let info = self.renderer.parse(source).await?;
                Ok(NodeOutput::new(serde_json::to_value(&info)?))
            }
            Operation::Detect => {
                let info = self.renderer.parse(source).await?;
                match info.diagram_type {
                    Some(kind) => Ok(NodeOutput::text(kind)),
                    None => Err(FlowError::Diagram(
                        info.error
                            .unwrap_or_else(|| "diagram type not recognised".into()),
                    )),
                }
            }
        }
    }
}

fn diagram_error(e: FlowError) -> FlowError {
    match e {
        FlowError::Diagram(_) | FlowError::Cancelled => e,
        other => FlowError::Diagram(other.to_string()),
    }
}

impl NodeExecutor for DiagramExecutor {
    fn validate(&self, node: &Node) -> Result<()> {
        let config: DiagramConfig = parse_config(node)?;
        if config.source.trim().is_empty() {
            return Err(FlowError::config(&node.id, "diagram source is empty"));
        }
        Ok(())
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: DiagramConfig = parse_config(&ctx.node)?;
            let source = ctx.resolve(&config.source);

            let outcome = tokio::select! {
                outcome = self.perform(&config, &source) => outcome,
                _ = ctx.cancel.cancelled() => Err(FlowError::Cancelled),
            };
            outcome.map_err(|e| diagram_error(e).into())
        })
    }
}
