use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use flowrun_core::config::EngineConfig;
use flowrun_core::document::{FlowDocument, SCHEMA_VERSION};
use flowrun_core::error::FlowError;
use flowrun_core::traits::StaticCredentials;
use flowrun_core::types::{Edge, Graph, ModelReply, Node, NodeStatus};
use flowrun_engine::{Collaborators, Engine, ExecutorRegistry, RunInput, ToolRegistry};
use flowrun_test_utils::{FlakyHttpClient, MockModelProvider, MockRenderer, MockSandbox};

fn digest_graph() -> Graph {
    let mut draft = Node::new("draft", "notes").with_config(json!({"content": "draft"}));
    draft.disabled = true;
    Graph::new(
        vec![
            Node::new("topic", "notes")
                .with_label("Topic")
                .with_config(json!({"content": "rust {{input}}"})),
            Node::new("summarize", "model-call").with_config(json!({
                "system_prompt": "Summarize",
                "user_prompt": "Write about {{Topic}}"
            })),
            draft,
            Node::new("publish", "notes")
                .with_config(json!({"content": "{{summarize}} ({{draft}})"})),
        ],
        vec![
            Edge::new("topic", "summarize"),
            Edge::new("summarize", "publish"),
            Edge::new("draft", "publish"),
        ],
    )
}

fn engine(model: MockModelProvider) -> (Engine, Arc<MockModelProvider>) {
    let model = Arc::new(model);
    let collab = Collaborators {
        model: model.clone(),
        sandbox: Arc::new(MockSandbox::returning(json!(null))),
        http: Arc::new(FlakyHttpClient::new(0, 500, "{}")),
        diagrams: Arc::new(MockRenderer::default()),
        tools: Arc::new(ToolRegistry::new()),
        credentials: Arc::new(StaticCredentials::default()),
    };
    let config = EngineConfig::default();
    (Engine::new(ExecutorRegistry::standard(collab, &config), &config), model)
}

#[test]
fn test_document_survives_disk_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("digest.json");
    let doc = FlowDocument::new("digest", digest_graph());
    std::fs::write(&path, doc.to_json().expect("serialize")).expect("write");

    let loaded = FlowDocument::load(&path).expect("load");
    assert_eq!(loaded.schema_version, SCHEMA_VERSION);
    assert_eq!(loaded.metadata.name, "digest");

    let graph = loaded.into_graph();
    assert_eq!(graph.nodes.len(), 4);
    assert_eq!(graph.edges.len(), 3);
    assert_eq!(graph.node("topic").map(|n| n.display_name()), Some("Topic"));
    assert!(graph.node("draft").is_some_and(|n| n.disabled));
}

#[test]
fn test_newer_schema_version_is_rejected() {
    let mut doc = FlowDocument::new("future", Graph::default());
    doc.schema_version = SCHEMA_VERSION + 1;
    let text = doc.to_json().expect("serialize");
    let err = FlowDocument::from_json(&text).unwrap_err();
    assert!(matches!(err, FlowError::Document(_)));
}

#[tokio::test]
async fn test_loaded_flow_runs_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("digest.json");
    std::fs::write(
        &path,
        FlowDocument::new("digest", digest_graph()).to_json().expect("serialize"),
    )
    .expect("write");

    let graph = FlowDocument::load(&path).expect("load").into_graph();
    let (engine, model) =
        engine(MockModelProvider::new().with_reply(ModelReply::text("Ownership, briefly.")));

    let report = engine
        .run(&graph, RunInput::new(json!("news")), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(report.count(NodeStatus::Success), 3);
    assert_eq!(report.count(NodeStatus::Skipped), 1);
    assert!(!report.has_errors());

    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].user_prompt, "Write about rust news");

    let publish = report.result("publish").expect("publish result");
    assert_eq!(publish.output, json!("Ownership, briefly. ({{draft}})"));
    assert!(!publish.warnings.is_empty());
}
