//! Persisted flow export format.
//!
//! A versioned JSON document holding metadata, the graph, credential
//! references and flow settings. Credential references name a secret; the
//! secret itself lives in the engine configuration.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::types::{Edge, Graph, Node};

/// Highest schema version this build understands.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDocument {
    pub schema_version: u32,
    pub metadata: FlowMetadata,
    pub graph: DocumentGraph,
    #[serde(default)]
    pub credentials: Vec<CredentialRef>,
    #[serde(default)]
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

/// Reference to a credential held outside the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CredentialRef {
    pub id: String,
    pub name: String,
    pub kind: String,
}

impl FlowDocument {
    /// Wrap a graph in a fresh document.
    pub fn new(name: impl Into<String>, graph: Graph) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            metadata: FlowMetadata {
                name: name.into(),
                description: None,
                created_at: now,
                updated_at: now,
            },
            graph: DocumentGraph {
                nodes: graph.nodes,
                edges: graph.edges,
                viewport: None,
            },
            credentials: vec![],
            settings: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let doc: FlowDocument = serde_json::from_str(text)
            .map_err(|e| FlowError::Document(e.to_string()))?;
        if doc.schema_version == 0 || doc.schema_version > SCHEMA_VERSION {
            return Err(FlowError::Document(format!(
                "unsupported schema version {} (this build reads up to {})",
                doc.schema_version, SCHEMA_VERSION
            )));
        }
        Ok(doc)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Executable graph view of this document.
    pub fn to_graph(&self) -> Graph {
        Graph::new(self.graph.nodes.clone(), self.graph.edges.clone())
    }

    pub fn into_graph(self) -> Graph {
        Graph::new(self.graph.nodes, self.graph.edges)
    }
}
