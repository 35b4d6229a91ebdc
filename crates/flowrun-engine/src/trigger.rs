//! Inbound gate for webhook-in triggers: signature check and rate limit.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::types::Node;

use crate::executors::WEBHOOK_IN;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` of the raw request body.
pub const SIGNATURE_HEADER: &str = "X-Flowrun-Signature";

const WINDOW: Duration = Duration::from_secs(60);

/// Configuration of a webhook-in node.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebhookTriggerConfig {
    /// Optional path override; the gateway serves `/hooks/<flow>` either way.
    pub path: Option<String>,
    pub secret: Option<String>,
    /// 0 = unlimited.
    pub rate_limit_per_minute: u32,
    pub require_signature: bool,
}

impl WebhookTriggerConfig {
    pub fn from_node(node: &Node) -> Result<Self> {
        if node.node_type != WEBHOOK_IN {
            return Err(FlowError::config(&node.id, "not a webhook-in node"));
        }
        let config: Self = crate::executors::parse_config(node)?;
        if config.require_signature && config.secret.as_deref().unwrap_or("").is_empty() {
            return Err(FlowError::config(&node.id, "require_signature needs a secret"));
        }
        Ok(config)
    }

    fn checks_signature(&self) -> bool {
        self.require_signature || self.secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = mac_for(secret)?;
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("sha256={hex}"))
}

/// Constant-time check of a `sha256=<hex>` header value.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(expected) = header
        .trim()
        .strip_prefix("sha256=")
        .and_then(decode_hex)
    else {
        return false;
    };
    let Ok(mut mac) = mac_for(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn mac_for(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| FlowError::Config(format!("invalid webhook secret: {e}")))
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| text.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// Admission control for one flow's webhook-in trigger.
pub struct InboundGate {
    config: WebhookTriggerConfig,
    /// Admission times inside the current sliding window.
    recent: Mutex<VecDeque<Instant>>,
}

impl InboundGate {
    pub fn new(config: WebhookTriggerConfig) -> Self {
        Self {
            config,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &WebhookTriggerConfig {
        &self.config
    }

    /// Check the request signature when the trigger asks for one.
    /// Verification alone never consumes a rate-limit slot.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<()> {
        if !self.config.checks_signature() {
            return Ok(());
        }
        let secret = self.config.secret.as_deref().unwrap_or("");
        let valid =
            !secret.is_empty() && signature.is_some_and(|sig| verify_signature(secret, body, sig));
        if valid {
            Ok(())
        } else {
            Err(FlowError::SignatureInvalid)
        }
    }

    /// Take a slot in the sliding window. Call only for requests that are
    /// otherwise accepted; refused admissions take no slot.
    pub fn admit(&self) -> Result<()> {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&self, now: Instant) -> Result<()> {
        let limit = self.config.rate_limit_per_minute;
        if limit == 0 {
            return Ok(());
        }
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        while recent
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= WINDOW)
        {
            recent.pop_front();
        }
        if recent.len() >= limit as usize {
            return Err(FlowError::RateLimited { limit });
        }
        recent.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate(config: serde_json::Value) -> InboundGate {
        let node = Node::new("in", WEBHOOK_IN).with_config(config);
        InboundGate::new(WebhookTriggerConfig::from_node(&node).unwrap())
    }

    #[test]
    fn signature_round_trip() {
        let sig = sign("s3cret", b"{\"a\":1}").unwrap();
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert!(verify_signature("s3cret", b"{\"a\":1}", &sig));
        assert!(!verify_signature("other", b"{\"a\":1}", &sig));
        assert!(!verify_signature("s3cret", b"{\"a\":2}", &sig));
        assert!(!verify_signature("s3cret", b"x", "sha256=zz"));
        assert!(!verify_signature("s3cret", b"x", "md5=00"));
    }

    #[test]
    fn secret_enforces_signature() {
        let g = gate(json!({"secret": "k"}));
        let body = b"payload";
        assert!(matches!(g.verify(body, None), Err(FlowError::SignatureInvalid)));
        assert!(matches!(
            g.verify(body, Some("sha256=00")),
            Err(FlowError::SignatureInvalid)
        ));
        assert!(g.verify(body, Some(&sign("k", body).unwrap())).is_ok());
    }

    #[test]
    fn open_trigger_accepts_unsigned() {
        let g = gate(json!({}));
        assert!(g.verify(b"anything", None).is_ok());
        assert!(g.admit().is_ok());
    }

    #[test]
    fn require_signature_without_secret_is_config_error() {
        let node = Node::new("in", WEBHOOK_IN).with_config(json!({"require_signature": true}));
        assert!(matches!(
            WebhookTriggerConfig::from_node(&node),
            Err(FlowError::NodeConfig { .. })
        ));
    }

    #[test]
    fn sliding_window_rate_limit() {
        let g = gate(json!({"rate_limit_per_minute": 2}));
        let t0 = Instant::now();
        assert!(g.admit_at(t0).is_ok());
        assert!(g.admit_at(t0 + Duration::from_secs(10)).is_ok());
        assert!(matches!(
            g.admit_at(t0 + Duration::from_secs(30)),
            Err(FlowError::RateLimited { limit: 2 })
        ));
        // First admission has left the window.
        assert!(g.admit_at(t0 + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn failed_verification_takes_no_slot() {
        let g = gate(json!({"secret": "k", "rate_limit_per_minute": 1}));
        for _ in 0..3 {
            assert!(g.verify(b"x", Some("sha256=00")).is_err());
        }
        assert!(g.admit().is_ok());
        assert!(matches!(g.admit(), Err(FlowError::RateLimited { limit: 1 })));
    }
}
