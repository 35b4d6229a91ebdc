use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level flowrun configuration (`flowrun.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub model: ModelDefaults,
    #[serde(default)]
    pub agent: AgentDefaults,
    #[serde(default)]
    pub webhook: WebhookDefaults,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub tools: Vec<HttpToolConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    /// Credential reference name → secret value.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Maximum nodes in flight at once (0 = unlimited).
    #[serde(default)]
    pub max_concurrency: usize,
    /// Default per-node timeout.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// How long in-flight nodes may run after cancellation.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            node_timeout_secs: default_node_timeout(),
            cancel_grace_ms: default_cancel_grace(),
        }
    }
}

fn default_node_timeout() -> u64 { 300 }
fn default_cancel_grace() -> u64 { 2_000 }

/// Fallbacks for model-call nodes that omit provider or sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefaults {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            temperature: None,
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_model() -> String { "claude-sonnet-4-20250514".to_string() }
fn default_max_tokens() -> u32 { 4096 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_parallel_tools")]
    pub parallel_tools: bool,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            parallel_tools: default_parallel_tools(),
        }
    }
}

fn default_max_steps() -> usize { 10 }
fn default_parallel_tools() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDefaults {
    #[serde(default = "default_webhook_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for WebhookDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_webhook_timeout(),
            retry_count: 0,
            retry_delay_ms: default_retry_delay(),
        }
    }
}

fn default_webhook_timeout() -> u64 { 30_000 }
fn default_retry_delay() -> u64 { 1_000 }

/// Endpoints for the HTTP bridge collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub model_url: Option<String>,
    #[serde(default)]
    pub sandbox_url: Option<String>,
    #[serde(default)]
    pub diagram_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            model_url: None,
            sandbox_url: None,
            diagram_url: None,
            api_key: None,
            timeout_secs: default_remote_timeout(),
        }
    }
}

fn default_remote_timeout() -> u64 { 120 }

/// A tool exposed to agents that POSTs its arguments to a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolConfig {
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(default = "default_tool_schema")]
    pub input_schema: serde_json::Value,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
}

fn default_tool_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}
fn default_tool_timeout() -> u64 { 30 }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./runs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run summary, 2 = per node, 3 = agent steps and warnings.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "runs".to_string() }
fn default_log_level() -> u8 { 2 }

/// Inbound webhook listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory of `<flow>.json` export documents served under `/hooks/<flow>`.
    #[serde(default = "default_flows_dir")]
    pub flows_dir: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            flows_dir: default_flows_dir(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }
fn default_flows_dir() -> String { "flows".to_string() }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Logging verbosity, when run logging is enabled.
    pub fn log_level(&self) -> u8 {
        self.log.as_ref().map(|l| l.level).unwrap_or_else(default_log_level)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| PathBuf::from(&l.log_dir))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FLOWRUN_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FLOWRUN_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FLOWRUN_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FLOWRUN_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FLOWRUN_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config.engine.max_concurrency, 0);
        assert_eq!(config.engine.node_timeout_secs, 300);
        assert_eq!(config.agent.max_steps, 10);
        assert!(config.agent.parallel_tools);
        assert_eq!(config.webhook.retry_count, 0);
        assert_eq!(config.webhook.retry_delay_ms, 1_000);
        assert!(config.remote.is_none());
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_sections_parse() {
        let toml_str = r#"
[engine]
max_concurrency = 4

[webhook]
retry_count = 3
retry_delay_ms = 250

[log]
log_dir = "/tmp/flowrun-logs"

[[tools]]
name = "search"
description = "Search the web"
url = "http://localhost:9000/search"

[credentials]
crm = "abc"
"#;
        let config = EngineConfig::parse(toml_str).unwrap();
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.webhook.retry_count, 3);
        assert_eq!(config.log_dir(), Some(PathBuf::from("/tmp/flowrun-logs")));
        assert_eq!(config.tools.len(), 1);
        assert_eq!(config.tools[0].timeout_secs, 30);
        assert_eq!(config.credentials.get("crm").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EngineConfig::parse("[engine\nmax = ").unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }
}
