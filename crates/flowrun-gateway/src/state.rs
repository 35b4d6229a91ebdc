use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use flowrun_core::config::GatewayConfig;
use flowrun_engine::{Engine, InboundGate, WebhookTriggerConfig};

/// Where and how verbosely runs started by the gateway are logged.
#[derive(Debug, Clone)]
pub struct RunLogSettings {
    pub dir: PathBuf,
    pub level: u8,
}

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Engine,
    pub run_log: Option<RunLogSettings>,
    /// Cancels every run the gateway started.
    pub shutdown: CancellationToken,
    gates: Mutex<HashMap<String, Arc<InboundGate>>>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        engine: Engine,
        run_log: Option<RunLogSettings>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            engine,
            run_log,
            shutdown,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn flow_path(&self, flow: &str) -> PathBuf {
        PathBuf::from(&self.config.flows_dir).join(format!("{flow}.json"))
    }

    /// Gate for `flow`, kept across requests so the rate window persists.
    /// A changed trigger configuration starts a fresh gate.
    pub fn gate(&self, flow: &str, config: WebhookTriggerConfig) -> Arc<InboundGate> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        match gates.get(flow) {
            Some(gate) if gate.config() == &config => gate.clone(),
            _ => {
                let gate = Arc::new(InboundGate::new(config));
                gates.insert(flow.to_string(), gate.clone());
                gate
            }
        }
    }
}
