use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use phaseflow_core::event::EventBus;
use phaseflow_core::types::{EngineEvent, ExecutionId, RunId};

/// JSONL event log for one execution.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{execution_id}/{timestamp}.jsonl`. Run-scoped events are
/// attributed to the execution through the `RunStarted` events seen earlier.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = execution and phase events,
    /// 2 = + runs, interactions and vibe checks, 3 = + every node.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger until cancellation or the execution finishes.
    ///
    /// Returns the path written to, or `None` if the file could not be opened.
    pub async fn run(
        self,
        event_bus: Arc<EventBus>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        // Subscribe before any await so no event published after spawn is missed.
        let mut rx = event_bus.subscribe();

        let execution_dir = self.log_dir.join(execution_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&execution_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = execution_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut runs: HashSet<RunId> = HashSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let EngineEvent::RunStarted { execution_id: id, run_id, .. } = &event {
                                if *id == execution_id {
                                    runs.insert(run_id.clone());
                                }
                            }

                            let entry = match self.event_to_entry(&execution_id, &runs, &event) {
                                Some(e) => e,
                                None => continue,
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                // Flush after each entry so a crash loses nothing written.
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(
                                event,
                                EngineEvent::ExecutionCompleted { .. } | EngineEvent::ExecutionFailed { .. }
                            ) {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// Convert an event to a log entry. Returns None for events of other
    /// executions and for events above the configured level.
    fn event_to_entry(
        &self,
        execution_id: &ExecutionId,
        runs: &HashSet<RunId>,
        event: &EngineEvent,
    ) -> Option<LogEntry> {
        let (level, run_id, detail) = match event {
            // L1: execution and phase lifecycle
            EngineEvent::ExecutionStarted {
                execution_id: id,
                process_id,
            } if id == execution_id => (1, None, Some(serde_json::json!({ "process_id": process_id }))),
            EngineEvent::PhaseCompleted {
                execution_id: id,
                phase_index,
            } if id == execution_id => (1, None, Some(serde_json::json!({ "phase_index": phase_index }))),
            EngineEvent::PhaseFailed {
                execution_id: id,
                phase_index,
                reason,
            } if id == execution_id => (
                1,
                None,
                Some(serde_json::json!({ "phase_index": phase_index, "reason": reason })),
            ),
            EngineEvent::ExecutionCompleted { execution_id: id } if id == execution_id => {
                (1, None, None)
            }
            EngineEvent::ExecutionFailed {
                execution_id: id,
                reason,
            } if id == execution_id => (1, None, Some(serde_json::json!({ "reason": reason }))),

            // L2: runs, interactions, vibe checks
            EngineEvent::RunStarted {
                execution_id: id,
                run_id,
                phase,
            } if id == execution_id => (2, Some(run_id), Some(serde_json::json!({ "phase": phase }))),
            EngineEvent::RunCompleted { run_id, steps } if runs.contains(run_id) => {
                (2, Some(run_id), Some(serde_json::json!({ "steps": steps })))
            }
            EngineEvent::RunFailed {
                run_id,
                node_id,
                error,
            } if runs.contains(run_id) => (
                2,
                Some(run_id),
                Some(serde_json::json!({ "node_id": node_id, "error": error })),
            ),
            EngineEvent::InteractionRequested { run_id, request } if runs.contains(run_id) => (
                2,
                Some(run_id),
                Some(serde_json::json!({
                    "request_id": request.id,
                    "interaction_type": request.interaction_type,
                    "question": request.question,
                })),
            ),
            EngineEvent::InteractionResolved { run_id, request_id }
            | EngineEvent::InteractionReleased { run_id, request_id }
                if runs.contains(run_id) =>
            {
                (2, Some(run_id), Some(serde_json::json!({ "request_id": request_id })))
            }
            EngineEvent::VibeCheckEvaluated {
                execution_id: id,
                question,
                required,
                passed,
            } if id == execution_id => (
                2,
                None,
                Some(serde_json::json!({
                    "question": question,
                    "required": required,
                    "passed": passed,
                })),
            ),

            // L3: every node
            EngineEvent::NodeStarted { run_id, node_id } if runs.contains(run_id) => {
                (3, Some(run_id), Some(serde_json::json!({ "node_id": node_id })))
            }
            EngineEvent::NodeCompleted {
                run_id,
                node_id,
                succeeded,
            } if runs.contains(run_id) => (
                3,
                Some(run_id),
                Some(serde_json::json!({ "node_id": node_id, "succeeded": succeeded })),
            ),

            _ => return None,
        };

        if level > self.level {
            return None;
        }

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: execution_id.to_string(),
            event_type: event.kind().to_string(),
            run_id: run_id.map(|r| r.to_string()),
            detail,
        })
    }
}
