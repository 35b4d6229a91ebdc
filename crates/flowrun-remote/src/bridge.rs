//! JSON-over-HTTP bridges for the model, sandbox and diagram services.
//!
//! Each bridge POSTs the engine's neutral request type to a configured
//! endpoint and reads the neutral reply back; provider wire formats live
//! behind that endpoint.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use flowrun_core::config::RemoteConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::{CodeSandbox, DiagramRenderer, ModelProvider};
use flowrun_core::types::{DiagramInfo, ModelReply, ModelRequest, SandboxOutcome};

/// One remote JSON endpoint.
#[derive(Clone)]
struct Endpoint {
    http: Client,
    url: Option<String>,
    api_key: Option<String>,
    service: &'static str,
    fail: fn(String) -> FlowError,
}

impl Endpoint {
    fn new(
        url: Option<String>,
        config: &RemoteConfig,
        service: &'static str,
        fail: fn(String) -> FlowError,
    ) -> Self {
        let mut builder = Client::builder();
        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.timeout_secs));
        }
        let http = builder
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, service, "Falling back to default HTTP client");
                Client::new()
            });
        Self {
            http,
            url,
            api_key: config.api_key.clone(),
            service,
            fail,
        }
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let Some(base) = &self.url else {
            return Err((self.fail)(format!("no {} endpoint configured", self.service)));
        };
        let url = format!("{}{}", base.trim_end_matches('/'), path);
        debug!(service = self.service, url = %url, "Calling remote service");

        let mut req = self.http.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| (self.fail)(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(300).collect();
            return Err((self.fail)(format!("{} returned {}: {}", self.service, status, snippet)));
        }
        resp.json::<R>()
            .await
            .map_err(|e| (self.fail)(format!("invalid {} reply: {}", self.service, e)))
    }
}

// ── Model ───────────────────────────────────────────────────────

pub struct RemoteModelProvider {
    endpoint: Endpoint,
}

impl RemoteModelProvider {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            endpoint: Endpoint::new(config.model_url.clone(), config, "model", FlowError::ModelCall),
        }
    }
}

impl ModelProvider for RemoteModelProvider {
    fn send(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelReply>> {
        Box::pin(async move { self.endpoint.post::<_, ModelReply>("", &request).await })
    }
}

// ── Sandbox ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct SandboxCall<'a> {
    source: &'a str,
    context: serde_json::Value,
    language: &'a str,
}

pub struct RemoteSandbox {
    endpoint: Endpoint,
}

impl RemoteSandbox {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            endpoint: Endpoint::new(config.sandbox_url.clone(), config, "sandbox", FlowError::Sandbox),
        }
    }
}

impl CodeSandbox for RemoteSandbox {
    fn run(
        &self,
        source: &str,
        context: serde_json::Value,
        language: &str,
    ) -> BoxFuture<'_, Result<SandboxOutcome>> {
        let call = SandboxCall {
            source,
            context,
            language,
        };
        let body = serde_json::to_value(&call).map_err(FlowError::from);
        Box::pin(async move {
            let body = body?;
            self.endpoint.post::<_, SandboxOutcome>("", &body).await
        })
    }
}

// ── Diagrams ────────────────────────────────────────────────────

#[derive(Serialize)]
struct RenderCall<'a> {
    source: &'a str,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    theme: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RenderReply {
    markup: String,
}

pub struct RemoteDiagramRenderer {
    endpoint: Endpoint,
}

impl RemoteDiagramRenderer {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            endpoint: Endpoint::new(config.diagram_url.clone(), config, "diagram", FlowError::Diagram),
        }
    }
}

impl DiagramRenderer for RemoteDiagramRenderer {
    fn render(
        &self,
        source: &str,
        format: &str,
        theme: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<String>> {
        let body = serde_json::to_value(RenderCall {
            source,
            format,
            theme,
        })
        .map_err(FlowError::from);
        Box::pin(async move {
            let body = body?;
            let reply: RenderReply = self.endpoint.post("/render", &body).await?;
            Ok(reply.markup)
        })
    }

    fn parse(&self, source: &str) -> BoxFuture<'_, Result<DiagramInfo>> {
        let body = serde_json::json!({ "source": source });
        Box::pin(async move { self.endpoint.post::<_, DiagramInfo>("/parse", &body).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::types::ModelRef;

    #[tokio::test]
    async fn missing_endpoint_is_service_error() {
        let config = RemoteConfig::default();
        let err = RemoteModelProvider::new(&config)
            .send(ModelRequest {
                system_prompt: String::new(),
                user_prompt: "hi".into(),
                model: ModelRef {
                    provider: "remote".into(),
                    model: "any".into(),
                },
                sampling: Default::default(),
                schema: None,
                messages: vec![],
                tools: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::ModelCall(ref m) if m.contains("no model endpoint")));

        let err = RemoteSandbox::new(&config)
            .run("1", serde_json::json!({}), "javascript")
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Sandbox(_)));

        let err = RemoteDiagramRenderer::new(&config).parse("graph TD").await.unwrap_err();
        assert!(matches!(err, FlowError::Diagram(_)));
    }

    #[test]
    fn sandbox_call_shape() {
        let call = SandboxCall {
            source: "return 1",
            context: serde_json::json!({"input": "x"}),
            language: "javascript",
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["source"], "return 1");
        assert_eq!(value["context"]["input"], "x");
    }

    #[test]
    fn sandbox_outcome_wire_format() {
        let ok: SandboxOutcome = serde_json::from_str(r#"{"value": {"n": 1}}"#).unwrap();
        assert!(matches!(ok, SandboxOutcome::Value(ref v) if v["n"] == 1));
        let failed: SandboxOutcome = serde_json::from_str(r#"{"error": "boom"}"#).unwrap();
        assert!(matches!(failed, SandboxOutcome::Error(ref m) if m == "boom"));
    }
}
