use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph errors
    #[error("Graph contains a cycle through: {}", nodes.join(", "))]
    GraphCycle { nodes: Vec<String> },

    #[error("Edge {edge} references unknown node: {node}")]
    UnknownNode { edge: String, node: String },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    // Node configuration errors
    #[error("Invalid configuration for node {node}: {message}")]
    NodeConfig { node: String, message: String },

    #[error("No executor registered for node type: {0}")]
    UnsupportedNodeType(String),

    #[error("Credential not found: {0}")]
    CredentialNotFound(String),

    // Executor errors
    #[error("Model call failed: {0}")]
    ModelCall(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Code snippet failed: {0}")]
    Snippet(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Webhook failed after {attempts} attempt(s): {message}")]
    Webhook { attempts: u32, message: String },

    #[error("Diagram render failed: {0}")]
    Diagram(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Node timed out after {0}ms")]
    NodeTimeout(u64),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Executor panicked: {0}")]
    ExecutorPanic(String),

    // Inbound webhook errors
    #[error("Webhook signature invalid")]
    SignatureInvalid,

    #[error("Rate limit exceeded ({limit} requests per minute)")]
    RateLimited { limit: u32 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Flow document error: {0}")]
    Document(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error taxonomy surfaced on node results.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed graph or node configuration.
    Configuration,
    /// A referenced variable was not available.
    DependencyUnresolved,
    /// The node's own external call failed.
    Executor,
    /// The graph is not a DAG.
    GraphCycle,
    /// The run was cancelled.
    Cancellation,
    /// Local I/O or encoding failure.
    Internal,
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::GraphCycle { .. } => ErrorKind::GraphCycle,
            Self::UnknownNode { .. }
            | Self::DuplicateNode(_)
            | Self::NodeConfig { .. }
            | Self::UnsupportedNodeType(_)
            | Self::CredentialNotFound(_)
            | Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::Document(_) => ErrorKind::Configuration,
            Self::ModelCall(_)
            | Self::Sandbox(_)
            | Self::Snippet(_)
            | Self::Http(_)
            | Self::Webhook { .. }
            | Self::Diagram(_)
            | Self::ToolNotFound(_)
            | Self::ToolExecution { .. }
            | Self::ToolTimeout { .. }
            | Self::NodeTimeout(_)
            | Self::SignatureInvalid
            | Self::RateLimited { .. } => ErrorKind::Executor,
            Self::Cancelled => ErrorKind::Cancellation,
            Self::ExecutorPanic(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for a node configuration error.
    pub fn config(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeConfig {
            node: node.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_names_nodes() {
        let err = FlowError::GraphCycle {
            nodes: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Graph contains a cycle through: a, b");
        assert_eq!(err.kind(), ErrorKind::GraphCycle);
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(FlowError::config("n1", "bad").kind(), ErrorKind::Configuration);
        assert_eq!(
            FlowError::Webhook {
                attempts: 3,
                message: "503".into()
            }
            .kind(),
            ErrorKind::Executor
        );
        assert_eq!(FlowError::Cancelled.kind(), ErrorKind::Cancellation);
    }
}
