//! Node executors: one strategy per node type tag.

pub mod code;
pub mod diagram;
pub mod model;
pub mod notes;
pub mod webhook;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use flowrun_core::config::EngineConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::event::EventBus;
use flowrun_core::traits::{
    CodeSandbox, CredentialResolver, DiagramRenderer, HttpClient, ModelProvider,
};
use flowrun_core::types::{AgentStep, ExecutionResult, Node, RunId, TokenUsage};

use crate::agent_loop::AgentAbort;
use crate::tools::ToolRegistry;
use crate::variables::{self, VariableScope};

pub use code::CodeRunExecutor;
pub use diagram::DiagramExecutor;
pub use model::ModelCallExecutor;
pub use notes::NotesExecutor;
pub use webhook::WebhookOutExecutor;

/// Type tag of the passive trigger node; handled by the orchestrator.
pub const WEBHOOK_IN: &str = "webhook-in";

/// Everything a node needs while it executes.
pub struct NodeContext {
    pub run_id: RunId,
    pub node: Node,
    /// Resolved input as text (`{{input}}`).
    pub input: String,
    /// Resolved input as a value: the single predecessor's raw output, the
    /// joined text for several predecessors, or the run input for roots.
    pub input_value: Value,
    pub scope: VariableScope,
    pub cancel: CancellationToken,
    pub events: Arc<EventBus>,
    warnings: Mutex<Vec<String>>,
}

impl NodeContext {
    pub fn new(
        run_id: RunId,
        node: Node,
        input_value: Value,
        mut scope: VariableScope,
        cancel: CancellationToken,
        events: Arc<EventBus>,
    ) -> Self {
        let input = flowrun_core::types::value_to_text(&input_value);
        scope.input = input.clone();
        Self {
            run_id,
            node,
            input,
            input_value,
            scope,
            cancel,
            events,
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// Expand `{{…}}` tokens, recording any dependency warnings on this node.
    pub fn resolve(&self, text: &str) -> String {
        let resolved = variables::resolve(text, &self.scope);
        if !resolved.warnings.is_empty() {
            self.push_warnings(resolved.warnings);
        }
        resolved.text
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push_warnings(vec![message.into()]);
    }

    fn push_warnings(&self, new: Vec<String>) {
        if let Ok(mut warnings) = self.warnings.lock() {
            warnings.extend(new);
        }
    }

    /// Drain the dependency warnings collected so far.
    pub fn take_warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default()
    }

    /// Results recorded before this node started.
    pub fn results(&self) -> &HashMap<String, ExecutionResult> {
        &self.scope.results
    }
}

/// Successful node outcome.
#[derive(Debug, Default)]
pub struct NodeOutput {
    pub output: Value,
    pub fields: Option<Map<String, Value>>,
    pub projection: Option<String>,
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
    pub agent_steps: Vec<AgentStep>,
    pub warnings: Vec<String>,
}

impl NodeOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Value::String(text.into()))
    }

    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields = Some(fields);
        self
    }
}

/// Failed node outcome, keeping whatever partial work was done.
#[derive(Debug)]
pub struct NodeFailure {
    pub error: FlowError,
    pub agent_steps: Vec<AgentStep>,
    pub usage: Option<TokenUsage>,
}

impl From<FlowError> for NodeFailure {
    fn from(error: FlowError) -> Self {
        Self {
            error,
            agent_steps: vec![],
            usage: None,
        }
    }
}

impl From<AgentAbort> for NodeFailure {
    fn from(abort: AgentAbort) -> Self {
        Self {
            error: abort.error,
            agent_steps: abort.steps,
            usage: Some(abort.usage),
        }
    }
}

pub type NodeResult = std::result::Result<NodeOutput, NodeFailure>;

/// Strategy for one node type.
pub trait NodeExecutor: Send + Sync + 'static {
    /// Check the node's configuration before dispatch.
    fn validate(&self, node: &Node) -> Result<()>;

    /// Execute the node. Dependency warnings go through `ctx.resolve`.
    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, NodeResult>;
}

/// External services the standard executors call out to.
#[derive(Clone)]
pub struct Collaborators {
    pub model: Arc<dyn ModelProvider>,
    pub sandbox: Arc<dyn CodeSandbox>,
    pub http: Arc<dyn HttpClient>,
    pub diagrams: Arc<dyn DiagramRenderer>,
    pub tools: Arc<ToolRegistry>,
    pub credentials: Arc<dyn CredentialResolver>,
}

/// Type tag → executor.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registry with every built-in node type wired to `collab`.
    pub fn standard(collab: Collaborators, config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        registry.register(
            model::TAG,
            ModelCallExecutor::new(
                collab.model.clone(),
                collab.tools.clone(),
                config.model.clone(),
                config.agent.clone(),
            ),
        );
        registry.register(code::TAG, CodeRunExecutor::new(collab.sandbox.clone()));
        registry.register(
            webhook::TAG,
            WebhookOutExecutor::new(
                collab.http.clone(),
                collab.credentials.clone(),
                config.webhook.clone(),
            ),
        );
        registry.register(notes::TAG, NotesExecutor);
        registry.register(diagram::TAG, DiagramExecutor::new(collab.diagrams.clone()));
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, executor: impl NodeExecutor) {
        self.executors.insert(tag.into(), Arc::new(executor));
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(tag).cloned()
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Deserialize a node's config into an executor's typed config.
pub(crate) fn parse_config<T: DeserializeOwned>(node: &Node) -> Result<T> {
    let value = if node.config.is_null() {
        Value::Object(Map::new())
    } else {
        node.config.clone()
    };
    serde_json::from_value(value).map_err(|e| FlowError::config(&node.id, e.to_string()))
}

/// Top-level entries of an object value, used as its field view.
pub(crate) fn top_level_fields(value: &Value) -> Option<Map<String, Value>> {
    value.as_object().cloned()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Context for a node with no predecessors.
    pub fn context(node: Node, input: Value) -> NodeContext {
        NodeContext::new(
            RunId::new(),
            node,
            input,
            VariableScope::default(),
            CancellationToken::new(),
            Arc::new(EventBus::default()),
        )
    }

    /// Context whose scope holds the given successful results.
    pub fn context_with(node: Node, input: Value, done: &[(&str, Value)]) -> NodeContext {
        let mut scope = VariableScope::default();
        for (id, output) in done {
            let mut r = ExecutionResult::pending(*id);
            r.status = flowrun_core::types::NodeStatus::Success;
            r.output = output.clone();
            scope.results.insert(id.to_string(), r);
        }
        NodeContext::new(
            RunId::new(),
            node,
            input,
            scope,
            CancellationToken::new(),
            Arc::new(EventBus::default()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_collects_resolution_warnings() {
        let ctx = test_support::context(Node::new("n", "notes"), json!("hello"));
        assert_eq!(ctx.input, "hello");
        assert_eq!(ctx.resolve("{{input}} {{ghost}}"), "hello {{ghost}}");
        assert_eq!(ctx.take_warnings().len(), 1);
        assert!(ctx.take_warnings().is_empty());
    }

    #[test]
    fn parse_config_reports_node() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Needs {
            url: String,
        }
        let node = Node::new("hook", "webhook-out");
        let err = parse_config::<Needs>(&node).unwrap_err();
        assert!(err.to_string().contains("hook"));
    }

    #[test]
    fn registry_lookup() {
        let mut registry = ExecutorRegistry::new();
        registry.register("notes", NotesExecutor);
        assert!(registry.get("notes").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.tags(), vec!["notes"]);
    }
}
