use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use flowrun_core::config::{AgentDefaults, ModelDefaults};
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::ModelProvider;
use flowrun_core::types::{ModelRef, ModelRequest, Node, SamplingParams};

use super::{parse_config, top_level_fields, NodeContext, NodeExecutor, NodeOutput, NodeResult};
use crate::agent_loop::{AgentLoop, AgentTask, Termination};
use crate::structured::{fields_to_schema, flatten_fields, leaf_paths, render_projection};
use crate::tools::ToolRegistry;

pub const TAG: &str = "model-call";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Csv,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AgentConfig {
    enabled: bool,
    max_steps: Option<usize>,
    tools: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelCallConfig {
    provider: Option<String>,
    model: Option<String>,
    system_prompt: String,
    user_prompt: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    output_format: OutputFormat,
    schema: Option<Value>,
    csv_fields: Option<String>,
    agent: AgentConfig,
}

impl ModelCallConfig {
    /// Schema sent with the request, if the output format needs one.
    fn schema(&self) -> Option<Value> {
        match self.output_format {
            OutputFormat::Text => None,
            OutputFormat::Json => self.schema.clone(),
            OutputFormat::Csv => Some(fields_to_schema(self.csv_fields.as_deref().unwrap_or(""))),
        }
    }
}

/// Prompted model call, optionally running the agent loop with tools.
pub struct ModelCallExecutor {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    model_defaults: ModelDefaults,
    agent_defaults: AgentDefaults,
}

impl ModelCallExecutor {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        model_defaults: ModelDefaults,
        agent_defaults: AgentDefaults,
    ) -> Self {
        Self {
            provider,
            tools,
            model_defaults,
            agent_defaults,
        }
    }

    fn model_ref(&self, config: &ModelCallConfig) -> ModelRef {
        ModelRef {
            provider: config
                .provider
                .clone()
                .unwrap_or_else(|| self.model_defaults.provider.clone()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| self.model_defaults.model.clone()),
        }
    }

    fn sampling(&self, config: &ModelCallConfig) -> SamplingParams {
        SamplingParams {
            temperature: config.temperature.or(self.model_defaults.temperature),
            max_tokens: Some(config.max_tokens.unwrap_or(self.model_defaults.max_tokens)),
            top_p: config.top_p,
        }
    }

    async fn call_once(&self, ctx: &NodeContext, config: &ModelCallConfig) -> NodeResult {
        let schema = config.schema();
        let request = ModelRequest {
            system_prompt: ctx.resolve(&config.system_prompt),
            user_prompt: ctx.resolve(config.user_prompt.as_deref().unwrap_or("{{input}}")),
            model: self.model_ref(config),
            sampling: self.sampling(config),
            schema: schema.clone(),
            messages: vec![],
            tools: vec![],
        };

        let reply = tokio::select! {
            reply = self.provider.send(request) => reply,
            _ = ctx.cancel.cancelled() => return Err(FlowError::Cancelled.into()),
        }?;

        let mut out = shape_output(config.output_format, schema.as_ref(), reply.text, reply.structured);
        out.usage = Some(reply.usage);
        out.cost_usd = reply.cost_usd;
        Ok(out)
    }

    async fn call_agent(&self, ctx: &NodeContext, config: &ModelCallConfig) -> NodeResult {
        let schema = config.schema();
        let task = AgentTask {
            system_prompt: ctx.resolve(&config.system_prompt),
            user_prompt: ctx.resolve(config.user_prompt.as_deref().unwrap_or("{{input}}")),
            model: self.model_ref(config),
            sampling: self.sampling(config),
            tools: config.agent.tools.clone(),
            max_steps: config.agent.max_steps.unwrap_or(self.agent_defaults.max_steps),
            schema: schema.clone(),
        };
        let max_steps = task.max_steps;

        let agent = AgentLoop::new(self.provider.clone(), self.tools.clone(), ctx.events.clone())
            .parallel_tools(self.agent_defaults.parallel_tools);
        let run = agent
            .run(&ctx.run_id, &ctx.node.id, task, &ctx.cancel)
            .await?;

        let mut out = shape_output(config.output_format, schema.as_ref(), Some(run.answer), None);
        if run.termination == Termination::StepLimit {
            warn!(node_id = %ctx.node.id, max_steps, "Agent stopped at step limit");
            out.warnings
                .push(format!("agent stopped after reaching the step limit ({max_steps})"));
        }
        out.usage = Some(run.usage);
        out.cost_usd = run.cost_usd;
        out.agent_steps = run.steps;
        Ok(out)
    }
}

impl NodeExecutor for ModelCallExecutor {
    fn validate(&self, node: &Node) -> Result<()> {
        let config: ModelCallConfig = parse_config(node)?;
        if config.output_format == OutputFormat::Csv {
            let schema = config.schema().unwrap_or(Value::Null);
            if leaf_paths(&schema).is_empty() {
                return Err(FlowError::config(&node.id, "csv output needs at least one field"));
            }
        }
        if let Some(t) = config.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(FlowError::config(&node.id, format!("temperature {t} out of range")));
            }
        }
        if config.agent.enabled && config.agent.max_steps == Some(0) {
            return Err(FlowError::config(&node.id, "agent max_steps must be at least 1"));
        }
        Ok(())
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: ModelCallConfig = parse_config(&ctx.node)?;
            debug!(
                node_id = %ctx.node.id,
                agent = config.agent.enabled,
                format = ?config.output_format,
                "Model call"
            );
            if config.agent.enabled {
                self.call_agent(ctx, &config).await
            } else {
                self.call_once(ctx, &config).await
            }
        })
    }
}

/// Parse model text as JSON, tolerating a surrounding code fence.
fn parse_json_text(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let body = match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
            rest.trim_end().strip_suffix("```").unwrap_or(rest)
        }
        None => trimmed,
    };
    serde_json::from_str(body.trim()).ok()
}

/// Turn a model reply into node output according to the output format.
fn shape_output(
    format: OutputFormat,
    schema: Option<&Value>,
    text: Option<String>,
    structured: Option<Value>,
) -> NodeOutput {
    if format == OutputFormat::Text {
        let text = text
            .or_else(|| structured.map(|v| v.to_string()))
            .unwrap_or_default();
        return NodeOutput::text(text);
    }

    let parsed = structured.or_else(|| text.as_deref().and_then(parse_json_text));
    let Some(value) = parsed else {
        let mut out = NodeOutput::text(text.unwrap_or_default());
        out.warnings
            .push("model reply is not valid JSON; keeping raw text".to_string());
        return out;
    };

    let leaves = schema.map(leaf_paths).unwrap_or_default();
    let fields = match (format, schema) {
        (OutputFormat::Csv, Some(schema)) => Some(flatten_fields(&value, schema)),
        (_, Some(schema)) if !leaves.is_empty() => Some(flatten_fields(&value, schema)),
        _ => top_level_fields(&value),
    };
    let projection = match format {
        OutputFormat::Csv => fields.as_ref().map(render_projection),
        _ => None,
    };

    let mut out = NodeOutput::new(value);
    out.fields = fields;
    out.projection = projection;
    out
}
