use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use flowrun_core::config::WebhookDefaults;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::{CredentialResolver, HttpClient};
use flowrun_core::types::{AuthMode, HttpRequest, HttpResponse, Node};

use super::{parse_config, NodeContext, NodeExecutor, NodeOutput, NodeResult};

pub const TAG: &str = "webhook-out";

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookConfig {
    url: String,
    method: Option<String>,
    headers: HashMap<String, String>,
    /// Text body, or a JSON value sent as serialized JSON.
    body: Option<Value>,
    auth: AuthMode,
    credential: Option<String>,
    api_key_header: Option<String>,
    timeout_ms: Option<u64>,
    retry_count: Option<u32>,
    retry_delay_ms: Option<u64>,
}

impl WebhookConfig {
    fn method(&self) -> String {
        self.method
            .as_deref()
            .unwrap_or("POST")
            .to_ascii_uppercase()
    }
}

/// Outbound HTTP call with credential injection and fixed-delay retries.
pub struct WebhookOutExecutor {
    http: Arc<dyn HttpClient>,
    credentials: Arc<dyn CredentialResolver>,
    defaults: WebhookDefaults,
}

impl WebhookOutExecutor {
    pub fn new(
        http: Arc<dyn HttpClient>,
        credentials: Arc<dyn CredentialResolver>,
        defaults: WebhookDefaults,
    ) -> Self {
        Self {
            http,
            credentials,
            defaults,
        }
    }

    fn build_request(&self, ctx: &NodeContext, config: &WebhookConfig) -> Result<HttpRequest> {
        let credential = match (config.auth, &config.credential) {
            (AuthMode::None, _) => None,
            (_, Some(reference)) => Some(
                self.credentials
                    .resolve(reference)
                    .ok_or_else(|| FlowError::CredentialNotFound(reference.clone()))?,
            ),
            (_, None) => {
                return Err(FlowError::config(&ctx.node.id, "auth requires a credential"));
            }
        };

        let body = config.body.as_ref().map(|b| match b {
            Value::String(s) => ctx.resolve(s),
            other => resolve_json(ctx, other).to_string(),
        });

        Ok(HttpRequest {
            url: ctx.resolve(&config.url),
            method: config.method(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), ctx.resolve(v)))
                .collect(),
            body,
            auth: config.auth,
            credential,
            api_key_header: config
                .api_key_header
                .clone()
                .unwrap_or_else(flowrun_core::types::default_api_key_header),
            timeout_ms: config.timeout_ms.unwrap_or(self.defaults.timeout_ms),
        })
    }
}

/// Resolve tokens inside every string of a JSON body, keys included, so
/// substituted text is escaped when the body is serialized.
fn resolve_json(ctx: &NodeContext, value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(ctx.resolve(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_json(ctx, v)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (ctx.resolve(k), resolve_json(ctx, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn response_output(response: HttpResponse) -> NodeOutput {
    let parsed: Option<Value> = serde_json::from_str(&response.body).ok();
    let mut fields = Map::new();
    fields.insert("status".into(), Value::from(response.status));
    if let Some(Value::Object(obj)) = &parsed {
        for (k, v) in obj {
            fields.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    let output = parsed.unwrap_or(Value::String(response.body));
    NodeOutput::new(output).with_fields(fields)
}

fn describe_failure(response: &HttpResponse) -> String {
    let snippet: String = response.body.chars().take(200).collect();
    if snippet.is_empty() {
        format!("HTTP {}", response.status)
    } else {
        format!("HTTP {}: {}", response.status, snippet)
    }
}

impl NodeExecutor for WebhookOutExecutor {
    fn validate(&self, node: &Node) -> Result<()> {
        let config: WebhookConfig = parse_config(node)?;
        if config.url.trim().is_empty() {
            return Err(FlowError::config(&node.id, "url is required"));
        }
        let method = config.method();
        if !METHODS.contains(&method.as_str()) {
            return Err(FlowError::config(
                &node.id,
                format!("unsupported method {method}"),
            ));
        }
        if config.auth != AuthMode::None && config.credential.is_none() {
            return Err(FlowError::config(&node.id, "auth requires a credential"));
        }
        Ok(())
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let config: WebhookConfig = parse_config(&ctx.node)?;
            let request = self.build_request(ctx, &config)?;
            let retries = config.retry_count.unwrap_or(self.defaults.retry_count);
            let delay = Duration::from_millis(
                config.retry_delay_ms.unwrap_or(self.defaults.retry_delay_ms),
            );
            let attempts = retries.saturating_add(1);
            let mut last_error = String::new();

            for attempt in 1..=attempts {
                let outcome = tokio::select! {
                    outcome = self.http.request(request.clone()) => outcome,
                    _ = ctx.cancel.cancelled() => return Err(FlowError::Cancelled.into()),
                };

                match outcome {
                    Ok(response) if response.is_success() => {
                        info!(
                            node_id = %ctx.node.id,
                            status = response.status,
                            attempt,
                            "Webhook delivered"
                        );
                        return Ok(response_output(response));
                    }
                    Ok(response) => last_error = describe_failure(&response),
                    Err(e) => last_error = e.to_string(),
                }

                if attempt < attempts {
                    warn!(
                        node_id = %ctx.node.id,
                        attempt,
                        error = %last_error,
                        "Webhook attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => return Err(FlowError::Cancelled.into()),
                    }
                }
            }

            Err(FlowError::Webhook {
                attempts,
                message: last_error,
            }
            .into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::{context, context_with};
    use flowrun_core::traits::StaticCredentials;
    use flowrun_test_utils::FlakyHttpClient;
    use serde_json::json;

    fn executor(http: Arc<FlakyHttpClient>) -> WebhookOutExecutor {
        let mut creds = StaticCredentials::default();
        creds.insert("crm", "tok-123");
        WebhookOutExecutor::new(http, Arc::new(creds), WebhookDefaults::default())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let http = Arc::new(FlakyHttpClient::new(2, 503, r#"{"ok": true}"#));
        let node = Node::new("hook", TAG).with_config(json!({
            "url": "https://example.test/hook",
            "retry_count": 2,
            "retry_delay_ms": 10
        }));
        let out = executor(http.clone()).execute(&context(node, json!(null))).await.unwrap();
        assert_eq!(http.calls(), 3);
        assert_eq!(out.output, json!({"ok": true}));
        let fields = out.fields.unwrap();
        assert_eq!(fields["status"], json!(200));
        assert_eq!(fields["ok"], json!(true));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_budget() {
        let http = Arc::new(FlakyHttpClient::new(5, 503, "ok"));
        let node = Node::new("hook", TAG).with_config(json!({
            "url": "https://example.test/hook",
            "retry_count": 1,
            "retry_delay_ms": 10
        }));
        let failure = executor(http.clone())
            .execute(&context(node, json!(null)))
            .await
            .unwrap_err();
        assert_eq!(http.calls(), 2);
        assert!(matches!(failure.error, FlowError::Webhook { attempts: 2, .. }));
        assert!(failure.error.to_string().contains("503"));
    }

    #[tokio::test]
    async fn resolves_variables_and_injects_credential() {
        let http = Arc::new(FlakyHttpClient::new(0, 500, "plain text"));
        let node = Node::new("hook", TAG).with_config(json!({
            "url": "https://example.test/{{topic}}",
            "method": "put",
            "headers": {"X-Topic": "{{topic}}"},
            "body": {"summary": "{{input}}"},
            "auth": "bearer",
            "credential": "crm"
        }));
        let ctx = context_with(node, json!("short"), &[("topic", json!("rust"))]);
        let out = executor(http.clone()).execute(&ctx).await.unwrap();
        assert_eq!(out.output, json!("plain text"));

        let sent = http.last_request().unwrap();
        assert_eq!(sent.url, "https://example.test/rust");
        assert_eq!(sent.method, "PUT");
        assert_eq!(sent.headers["X-Topic"], "rust");
        assert_eq!(sent.body.as_deref(), Some(r#"{"summary":"short"}"#));
        assert_eq!(sent.credential.as_deref(), Some("tok-123"));
    }

    #[tokio::test]
    async fn json_body_escapes_substituted_text() {
        let http = Arc::new(FlakyHttpClient::new(0, 500, "{}"));
        let node = Node::new("hook", TAG).with_config(json!({
            "url": "https://example.test/notes",
            "body": {"summary": "{{input}}", "tags": ["{{topic}}", 3], "{{topic}}_len": 1}
        }));
        let ctx = context_with(
            node,
            json!("he said \"hi\"\nbye"),
            &[("topic", json!("rust"))],
        );
        executor(http.clone()).execute(&ctx).await.unwrap();

        let sent = http.last_request().unwrap();
        let body: Value = serde_json::from_str(sent.body.as_deref().unwrap()).unwrap();
        assert_eq!(
            body,
            json!({"summary": "he said \"hi\"\nbye", "tags": ["rust", 3], "rust_len": 1})
        );
    }

    #[tokio::test]
    async fn huge_retry_count_does_not_overflow() {
        let http = Arc::new(FlakyHttpClient::new(0, 500, "ok"));
        let node = Node::new("hook", TAG).with_config(json!({
            "url": "https://example.test/hook",
            "retry_count": u32::MAX
        }));
        executor(http.clone()).execute(&context(node, json!(null))).await.unwrap();
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test]
    async fn missing_credential_fails() {
        let http = Arc::new(FlakyHttpClient::new(0, 500, ""));
        let node = Node::new("hook", TAG).with_config(json!({
            "url": "https://example.test",
            "auth": "api-key",
            "credential": "nope"
        }));
        let failure = executor(http.clone())
            .execute(&context(node, json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, FlowError::CredentialNotFound(_)));
        assert_eq!(http.calls(), 0);
    }

    #[test]
    fn validation() {
        let ex = executor(Arc::new(FlakyHttpClient::new(0, 500, "")));
        assert!(ex.validate(&Node::new("h", TAG)).is_err());
        let bad_method = Node::new("h", TAG).with_config(json!({"url": "u", "method": "FETCH"}));
        assert!(ex.validate(&bad_method).is_err());
        let no_cred = Node::new("h", TAG).with_config(json!({"url": "u", "auth": "bearer"}));
        assert!(ex.validate(&no_cred).is_err());
        let ok = Node::new("h", TAG).with_config(json!({"url": "u"}));
        assert!(ex.validate(&ok).is_ok());
    }
}
