use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Model provider — the engine never sees provider wire formats.
pub trait ModelProvider: Send + Sync + 'static {
    /// Send one request and wait for the complete reply.
    fn send(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelReply>>;
}

/// Sandboxed interpreter for code-run nodes.
pub trait CodeSandbox: Send + Sync + 'static {
    /// Run `source` with a read-only `context` object.
    ///
    /// `Ok(SandboxOutcome::Error)` is the snippet's own failure; `Err` means
    /// the sandbox itself could not run it.
    fn run(
        &self,
        source: &str,
        context: serde_json::Value,
        language: &str,
    ) -> BoxFuture<'_, Result<SandboxOutcome>>;
}

/// Outbound HTTP for webhook-out nodes. Retries are the caller's job.
pub trait HttpClient: Send + Sync + 'static {
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;
}

/// Diagram rendering service.
pub trait DiagramRenderer: Send + Sync + 'static {
    /// Render diagram source to markup (usually SVG).
    fn render(
        &self,
        source: &str,
        format: &str,
        theme: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<String>>;

    /// Validate the source and detect its diagram type.
    fn parse(&self, source: &str) -> BoxFuture<'_, Result<DiagramInfo>>;
}

/// Tool — callable by the agent loop.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in model tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Looks up secrets by reference name. Flows only ever store the name.
pub trait CredentialResolver: Send + Sync + 'static {
    fn resolve(&self, reference: &str) -> Option<String>;
}

/// In-memory credential map, usually filled from the `[credentials]` config table.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    secrets: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    pub fn insert(&mut self, reference: impl Into<String>, secret: impl Into<String>) {
        self.secrets.insert(reference.into(), secret.into());
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, reference: &str) -> Option<String> {
        self.secrets.get(reference).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials_lookup() {
        let mut creds = StaticCredentials::default();
        creds.insert("crm", "s3cret");
        assert_eq!(creds.resolve("crm").as_deref(), Some("s3cret"));
        assert!(creds.resolve("other").is_none());
    }
}
