use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use flowrun_core::event::{EventBus, FlowEvent};
use flowrun_core::types::RunId;

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per event to
/// `{log_dir}/{run_id}.jsonl`, flushing after every line so a crash mid-run
/// leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a FlowEvent,
}

impl RunLogger {
    /// `level`: 1 = run summary, 2 = per node, 3 = agent steps and warnings.
    pub fn new(log_dir: impl Into<PathBuf>, level: u8) -> Self {
        Self {
            log_dir: log_dir.into(),
            level,
        }
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Start logging `run_id` in the background until its `RunFinished`.
    ///
    /// The subscription is taken before this returns, so events published
    /// right after the call are not missed.
    pub fn spawn(self, events: &Arc<EventBus>, run_id: RunId) -> JoinHandle<()> {
        let rx = events.subscribe();
        tokio::spawn(async move { self.run(rx, run_id).await })
    }

    async fn run(self, mut rx: tokio::sync::broadcast::Receiver<FlowEvent>, run_id: RunId) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        let log_path = self.path_for(&run_id);
        let Some(mut writer) = open_append(&log_path).await else {
            return;
        };
        info!(path = %log_path.display(), "RunLogger started");

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.run_id() != &run_id {
                        continue;
                    }
                    if self.includes(&event) {
                        let entry = LogEntry {
                            timestamp: Utc::now().to_rfc3339(),
                            event: &event,
                        };
                        if let Ok(json) = serde_json::to_string(&entry) {
                            let line = format!("{}\n", json);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush log");
                            }
                        }
                    }
                    if matches!(event, FlowEvent::RunFinished { .. }) {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    debug!(skipped = n, "RunLogger lagged, skipped events");
                }
                Err(RecvError::Closed) => {
                    debug!("EventBus closed, RunLogger stopping");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    fn includes(&self, event: &FlowEvent) -> bool {
        let needed = match event {
            FlowEvent::RunStarted { .. } | FlowEvent::RunFinished { .. } => 1,
            FlowEvent::NodeStarted { .. } | FlowEvent::NodeFinished { .. } => 2,
            FlowEvent::AgentStep { .. } | FlowEvent::DependencyWarning { .. } => 3,
        };
        self.level >= needed
    }
}

async fn open_append(path: &Path) -> Option<tokio::io::BufWriter<tokio::fs::File>> {
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(f) => Some(tokio::io::BufWriter::new(f)),
        Err(e) => {
            error!(error = %e, path = %path.display(), "Failed to open log file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::types::NodeStatus;

    fn finished(run_id: &RunId) -> FlowEvent {
        FlowEvent::RunFinished {
            run_id: run_id.clone(),
            succeeded: 1,
            failed: 0,
            skipped: 0,
            cancelled: false,
        }
    }

    async fn lines(path: &Path) -> Vec<serde_json::Value> {
        tokio::fs::read_to_string(path)
            .await
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let run_id = RunId::new();
        let logger = RunLogger::new(dir.path(), 2);
        let path = logger.path_for(&run_id);
        let handle = logger.spawn(&bus, run_id.clone());

        bus.publish(FlowEvent::RunStarted {
            run_id: run_id.clone(),
            node_count: 1,
        });
        bus.publish(FlowEvent::NodeFinished {
            run_id: run_id.clone(),
            node_id: "a".into(),
            status: NodeStatus::Success,
            error: None,
        });
        bus.publish(FlowEvent::DependencyWarning {
            run_id: run_id.clone(),
            node_id: "a".into(),
            message: "filtered at level 2".into(),
        });
        bus.publish(finished(&run_id));
        handle.await.unwrap();

        let entries = lines(&path).await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["event"], "run_started");
        assert_eq!(entries[1]["node_id"], "a");
        assert_eq!(entries[1]["status"], "success");
        assert!(entries[1]["timestamp"].is_string());
        assert_eq!(entries[2]["event"], "run_finished");
    }

    #[tokio::test]
    async fn ignores_other_runs() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let mine = RunId::new();
        let logger = RunLogger::new(dir.path(), 1);
        let path = logger.path_for(&mine);
        let handle = logger.spawn(&bus, mine.clone());

        bus.publish(finished(&RunId::new()));
        bus.publish(finished(&mine));
        handle.await.unwrap();

        assert_eq!(lines(&path).await.len(), 1);
    }
}
