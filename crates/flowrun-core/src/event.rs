use serde::Serialize;

use crate::types::{AgentStep, NodeStatus, RunId};

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    /// Run accepted and planned.
    RunStarted { run_id: RunId, node_count: usize },
    /// A node was dispatched.
    NodeStarted { run_id: RunId, node_id: String },
    /// A node reached a terminal state.
    NodeFinished {
        run_id: RunId,
        node_id: String,
        status: NodeStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A `{{token}}` could not be resolved for a node.
    DependencyWarning {
        run_id: RunId,
        node_id: String,
        message: String,
    },
    /// One agent iteration completed.
    AgentStep {
        run_id: RunId,
        node_id: String,
        step: AgentStep,
    },
    /// Run ended (all nodes terminal).
    RunFinished {
        run_id: RunId,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cancelled: bool,
    },
}

impl FlowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeFinished { run_id, .. }
            | Self::DependencyWarning { run_id, .. }
            | Self::AgentStep { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let run_id = RunId::new();
        bus.publish(FlowEvent::NodeStarted {
            run_id: run_id.clone(),
            node_id: "a".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), &run_id);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(FlowEvent::RunStarted {
            run_id: RunId::new(),
            node_count: 0,
        });
    }
}
