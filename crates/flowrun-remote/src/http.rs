use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::debug;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::HttpClient;
use flowrun_core::types::{AuthMode, HttpRequest, HttpResponse};

/// Outbound HTTP for webhook-out nodes.
///
/// Sends exactly one request per call; non-2xx responses are returned, not
/// turned into errors, so the caller can decide whether to retry.
pub struct ReqwestHttpClient {
    http: Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    fn build(&self, request: &HttpRequest) -> Result<reqwest::Request> {
        let method = request
            .method
            .to_uppercase()
            .parse::<reqwest::Method>()
            .map_err(|e| FlowError::Http(format!("Invalid method: {}", e)))?;

        let mut req = self
            .http
            .request(method, &request.url)
            .timeout(Duration::from_millis(request.timeout_ms));
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        match (request.auth, &request.credential) {
            (AuthMode::Bearer, Some(secret)) => req = req.bearer_auth(secret),
            (AuthMode::ApiKey, Some(secret)) => {
                req = req.header(request.api_key_header.as_str(), secret.as_str())
            }
            _ => {}
        }
        if let Some(body) = &request.body {
            if !request.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type"))
                && serde_json::from_str::<serde_json::Value>(body).is_ok()
            {
                req = req.header("Content-Type", "application/json");
            }
            req = req.body(body.clone());
        }
        req.build().map_err(|e| FlowError::Http(e.to_string()))
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let built = self.build(&request)?;
            debug!(method = %built.method(), url = %built.url(), "Sending HTTP request");
            let resp = self
                .http
                .execute(built)
                .await
                .map_err(|e| FlowError::Http(e.to_string()))?;
            let status = resp.status().as_u16();
            let body = resp
                .text()
                .await
                .map_err(|e| FlowError::Http(e.to_string()))?;
            Ok(HttpResponse { status, body })
        })
    }
}
