use std::collections::HashMap;
use std::sync::Arc;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::Tool;
use flowrun_core::types::{ToolDefinition, ToolResult};

/// Registry of tools available to agent-mode model calls.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for the model, restricted to `enabled` (empty = all).
    ///
    /// Names in `enabled` that are not registered are skipped.
    pub fn definitions(&self, enabled: &[String]) -> Vec<ToolDefinition> {
        self.list()
            .into_iter()
            .filter(|name| enabled.is_empty() || enabled.iter().any(|e| e == name))
            .filter_map(|name| self.tools.get(name))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, input: serde_json::Value) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| FlowError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(input)).await {
            Ok(result) => result,
            Err(_) => Err(FlowError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_test_utils::{EchoTool, SlowTool};

    #[tokio::test]
    async fn execute_known_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let result = registry
            .execute("echo", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_error() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, FlowError::ToolNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool::new(120));
        let err = registry.execute("slow", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, FlowError::ToolTimeout { timeout_secs: 1, .. }));
    }

    #[test]
    fn definitions_filter() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(SlowTool::new(1));
        assert_eq!(registry.definitions(&[]).len(), 2);
        let only = registry.definitions(&["echo".to_string(), "ghost".to_string()]);
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].name, "echo");
        assert_eq!(registry.list(), vec!["echo", "slow"]);
    }
}
