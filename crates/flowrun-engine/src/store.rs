use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

use flowrun_core::types::{ExecutionResult, NodeStatus, RunId, TokenUsage};

/// Per-run result table shared between the orchestrator and node tasks.
///
/// Every node starts `pending`. A terminal result is written at most once;
/// later writes for the same node are ignored.
#[derive(Clone)]
pub struct ResultStore {
    results: Arc<RwLock<HashMap<String, ExecutionResult>>>,
}

impl ResultStore {
    pub fn new<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let results = node_ids
            .into_iter()
            .map(|id| {
                let id = id.into();
                (id.clone(), ExecutionResult::pending(id))
            })
            .collect();
        Self {
            results: Arc::new(RwLock::new(results)),
        }
    }

    /// Move a pending node to `running`. Returns false if it was not pending.
    pub async fn mark_running(&self, node_id: &str) -> bool {
        let mut results = self.results.write().await;
        match results.get_mut(node_id) {
            Some(r) if r.status == NodeStatus::Pending => {
                r.status = NodeStatus::Running;
                r.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Record a terminal result. Returns false if the node already had one.
    pub async fn finish(&self, mut result: ExecutionResult) -> bool {
        let mut results = self.results.write().await;
        if let Some(existing) = results.get(&result.node_id) {
            if existing.status.is_terminal() {
                warn!(
                    node_id = %result.node_id,
                    existing = %existing.status,
                    attempted = %result.status,
                    "Ignoring second terminal write"
                );
                return false;
            }
            if result.started_at.is_none() {
                result.started_at = existing.started_at;
            }
        }
        if result.finished_at.is_none() {
            result.finished_at = Some(Utc::now());
        }
        results.insert(result.node_id.clone(), result);
        true
    }

    pub async fn get(&self, node_id: &str) -> Option<ExecutionResult> {
        self.results.read().await.get(node_id).cloned()
    }

    pub async fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.results.read().await.get(node_id).map(|r| r.status)
    }

    /// Copy of every result recorded so far.
    pub async fn snapshot(&self) -> HashMap<String, ExecutionResult> {
        self.results.read().await.clone()
    }

    /// Build the final report, results in `order`.
    pub async fn report(
        &self,
        run_id: RunId,
        order: &[String],
        started_at: DateTime<Utc>,
        cancelled: bool,
    ) -> RunReport {
        let results = self.results.read().await;
        RunReport {
            run_id,
            results: order.iter().filter_map(|id| results.get(id).cloned()).collect(),
            started_at,
            finished_at: Utc::now(),
            cancelled,
        }
    }
}

/// Outcome of one run: every node's result in execution-plan order.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub results: Vec<ExecutionResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn result(&self, node_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.node_id == node_id)
    }

    /// True when any node ended in `error`.
    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| r.status == NodeStatus::Error)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn total_usage(&self) -> TokenUsage {
        let mut total = TokenUsage::default();
        for usage in self.results.iter().filter_map(|r| r.usage) {
            total.add(usage);
        }
        total
    }

    pub fn total_cost_usd(&self) -> Option<f64> {
        let costs: Vec<f64> = self.results.iter().filter_map(|r| r.cost_usd).collect();
        if costs.is_empty() {
            None
        } else {
            Some(costs.iter().sum())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(id: &str, status: NodeStatus) -> ExecutionResult {
        let mut r = ExecutionResult::pending(id);
        r.status = status;
        r
    }

    #[tokio::test]
    async fn nodes_start_pending() {
        let store = ResultStore::new(["a", "b"]);
        assert_eq!(store.status("a").await, Some(NodeStatus::Pending));
        assert_eq!(store.status("b").await, Some(NodeStatus::Pending));
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn running_then_finish_keeps_start_time() {
        let store = ResultStore::new(["a"]);
        assert!(store.mark_running("a").await);
        assert!(!store.mark_running("a").await);
        let started = store.get("a").await.unwrap().started_at;
        assert!(started.is_some());

        assert!(store.finish(finished("a", NodeStatus::Success)).await);
        let r = store.get("a").await.unwrap();
        assert_eq!(r.started_at, started);
        assert!(r.finished_at.is_some());
    }

    #[tokio::test]
    async fn terminal_result_written_once() {
        let store = ResultStore::new(["a"]);
        assert!(store.finish(finished("a", NodeStatus::Skipped)).await);
        assert!(!store.finish(finished("a", NodeStatus::Success)).await);
        assert_eq!(store.status("a").await, Some(NodeStatus::Skipped));
        assert!(!store.mark_running("a").await);
    }

    #[tokio::test]
    async fn report_follows_order_and_sums_usage() {
        let store = ResultStore::new(["b", "a"]);
        let mut a = finished("a", NodeStatus::Success);
        a.usage = Some(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        });
        a.cost_usd = Some(0.5);
        let mut b = finished("b", NodeStatus::Error);
        b.usage = Some(TokenUsage {
            input_tokens: 1,
            output_tokens: 1,
        });
        store.finish(a).await;
        store.finish(b).await;

        let report = store
            .report(RunId::new(), &["a".into(), "b".into()], Utc::now(), false)
            .await;
        assert_eq!(report.results[0].node_id, "a");
        assert!(report.has_errors());
        assert_eq!(report.count(NodeStatus::Success), 1);
        assert_eq!(report.total_usage().total(), 17);
        assert_eq!(report.total_cost_usd(), Some(0.5));
    }
}
