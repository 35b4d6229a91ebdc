use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use flowrun_core::config::GatewayConfig;
use flowrun_engine::Engine;

use crate::routes;
use crate::state::{AppState, RunLogSettings};

/// HTTP listener that turns signed webhook calls into flow runs.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Engine,
    run_log: Option<RunLogSettings>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: Engine) -> Self {
        Self {
            config,
            engine,
            run_log: None,
        }
    }

    pub fn with_run_log(mut self, settings: RunLogSettings) -> Self {
        self.run_log = Some(settings);
        self
    }

    pub fn router(&self, shutdown: CancellationToken) -> Router {
        let state = Arc::new(AppState::new(
            self.config.clone(),
            self.engine.clone(),
            self.run_log.clone(),
            shutdown,
        ));

        Router::new()
            .route("/health", get(routes::health))
            .route("/hooks/{flow}", post(routes::hook))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the listener until the cancellation token is triggered.
    /// Runs still in flight are cancelled with it.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router(shutdown.clone());

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, flows_dir = %self.config.flows_dir, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use flowrun_core::config::EngineConfig;
    use flowrun_core::document::FlowDocument;
    use flowrun_core::types::{Edge, Graph, Node};
    use flowrun_engine::executors::{NotesExecutor, WEBHOOK_IN};
    use flowrun_engine::trigger::{sign, SIGNATURE_HEADER};
    use flowrun_engine::ExecutorRegistry;

    fn write_graph(dir: &std::path::Path, name: &str, graph: Graph) {
        let doc = FlowDocument::new(name, graph);
        std::fs::write(dir.join(format!("{name}.json")), doc.to_json().unwrap()).unwrap();
    }

    fn write_flow(dir: &std::path::Path, name: &str, trigger: serde_json::Value) {
        let graph = Graph::new(
            vec![
                Node::new("in", WEBHOOK_IN).with_config(trigger),
                Node::new("greet", "notes").with_config(json!({"content": "hi {{in.name}}"})),
            ],
            vec![Edge::new("in", "greet")],
        );
        write_graph(dir, name, graph);
    }

    fn server(dir: &std::path::Path) -> (GatewayServer, Engine) {
        let mut registry = ExecutorRegistry::new();
        registry.register("notes", NotesExecutor);
        let engine = Engine::new(registry, &EngineConfig::default());
        let config = GatewayConfig {
            flows_dir: dir.display().to_string(),
            ..Default::default()
        };
        (GatewayServer::new(config, engine.clone()), engine)
    }

    fn app(dir: &std::path::Path) -> (Router, Engine) {
        let (server, engine) = server(dir);
        (server.router(CancellationToken::new()), engine)
    }

    fn post(uri: &str, body: &str, signature: Option<String>) -> Request<Body> {
        let mut req = Request::builder().method("POST").uri(uri);
        if let Some(sig) = signature {
            req = req.header(SIGNATURE_HEADER, sig);
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn accepted_hook_starts_run() {
        let dir = tempfile::tempdir().unwrap();
        write_flow(dir.path(), "greeter", json!({}));
        let (app, engine) = app(dir.path());
        let mut events = engine.events().subscribe();

        let resp = app
            .oneshot(post("/hooks/greeter", r#"{"name":"Ada"}"#, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let finished = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Ok(flowrun_core::event::FlowEvent::RunFinished { succeeded, .. }) =
                    events.recv().await
                {
                    return succeeded;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(finished, 2);
    }

    #[tokio::test]
    async fn signature_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        write_flow(dir.path(), "signed", json!({"secret": "k"}));
        let (app, _) = app(dir.path());
        let body = r#"{"name":"Ada"}"#;

        let resp = app
            .clone()
            .oneshot(post("/hooks/signed", body, Some("sha256=00".into())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(post("/hooks/signed", body, Some(sign("k", body.as_bytes()).unwrap())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn rate_limit_applies_per_flow() {
        let dir = tempfile::tempdir().unwrap();
        write_flow(dir.path(), "limited", json!({"rate_limit_per_minute": 1}));
        let (app, _) = app(dir.path());

        let first = app.clone().oneshot(post("/hooks/limited", "{}", None)).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let second = app.oneshot(post("/hooks/limited", "{}", None)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn unknown_or_unsafe_flow_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());
        for uri in ["/hooks/missing", "/hooks/..%2Fsecrets"] {
            let resp = app.clone().oneshot(post(uri, "{}", None)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        write_flow(dir.path(), "greeter", json!({}));
        let (app, _) = app(dir.path());
        let resp = app.oneshot(post("/hooks/greeter", "not json", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_body_takes_no_rate_slot() {
        let dir = tempfile::tempdir().unwrap();
        write_flow(dir.path(), "limited", json!({"rate_limit_per_minute": 1}));
        let (app, _) = app(dir.path());

        let bad = app.clone().oneshot(post("/hooks/limited", "{oops", None)).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        let good = app.oneshot(post("/hooks/limited", "{}", None)).await.unwrap();
        assert_eq!(good.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn cyclic_flow_is_rejected_before_accepting() {
        let flows = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        write_graph(
            flows.path(),
            "loop",
            Graph::new(
                vec![
                    Node::new("in", WEBHOOK_IN),
                    Node::new("a", "notes"),
                    Node::new("b", "notes"),
                ],
                vec![Edge::new("in", "a"), Edge::new("a", "b"), Edge::new("b", "a")],
            ),
        );
        let (server, _) = server(flows.path());
        let app = server
            .with_run_log(RunLogSettings {
                dir: logs.path().to_path_buf(),
                level: 2,
            })
            .router(CancellationToken::new());

        let resp = app.oneshot(post("/hooks/loop", "{}", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(std::fs::read_dir(logs.path()).unwrap().count(), 0);
    }
}
