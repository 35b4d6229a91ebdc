use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;

use flowrun_core::config::HttpToolConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::Tool;
use flowrun_core::types::ToolResult;

/// Agent tool that POSTs its arguments as JSON to a fixed URL.
///
/// A non-2xx answer is reported back to the model as an error result
/// rather than failing the call.
pub struct HttpTool {
    config: HttpToolConfig,
    http: Client,
}

impl HttpTool {
    pub fn new(config: HttpToolConfig) -> Self {
        Self {
            config,
            http: Client::new(),
        }
    }

    /// One tool per `[[tools]]` entry.
    pub fn from_configs(configs: &[HttpToolConfig]) -> Vec<Self> {
        configs.iter().cloned().map(Self::new).collect()
    }

    fn failed(&self, message: impl Into<String>) -> FlowError {
        FlowError::ToolExecution {
            tool: self.config.name.clone(),
            message: message.into(),
        }
    }
}

impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        &self.config.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.config.input_schema.clone()
    }

    fn timeout_secs(&self) -> u64 {
        self.config.timeout_secs
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let resp = self
                .http
                .post(&self.config.url)
                .timeout(Duration::from_secs(self.config.timeout_secs))
                .json(&input)
                .send()
                .await
                .map_err(|e| self.failed(e.to_string()))?;
            let status = resp.status();
            let body = resp.text().await.map_err(|e| self.failed(e.to_string()))?;
            let truncated: String = body.chars().take(10_000).collect();

            if status.is_success() {
                Ok(ToolResult::success(truncated))
            } else {
                Ok(ToolResult::error(format!(
                    "HTTP {} {}\n\n{}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or(""),
                    truncated
                )))
            }
        })
    }
}
