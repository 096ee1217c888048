use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::event::EventBus;
use phaseflow_core::interaction::InteractionRequest;
use phaseflow_core::process::PhaseReport;
use phaseflow_core::types::{EngineEvent, ExecutionId, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    AwaitingInput,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::AwaitingInput => write!(f, "AWAITING_INPUT"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A background phase execution a caller can poll.
///
/// Once the job leaves `Running`, exactly one of `result`, `error` and
/// `pending_interaction` is set, matching the status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncJob {
    pub id: JobId,
    pub execution_id: ExecutionId,
    pub status: JobStatus,
    pub result: Option<PhaseReport>,
    pub error: Option<String>,
    pub pending_interaction: Option<InteractionRequest>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AsyncJob {
    fn new(execution_id: ExecutionId) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            execution_id,
            status: JobStatus::Running,
            result: None,
            error: None,
            pending_interaction: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.result = None;
        self.error = None;
        self.pending_interaction = None;
        self.updated_at = Utc::now();
    }
}

/// Mutex-guarded map of async jobs.
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, AsyncJob>>,
    event_bus: Arc<EventBus>,
}

impl JobRegistry {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register a new running job for an execution.
    pub async fn create(&self, execution_id: ExecutionId) -> JobId {
        let job = AsyncJob::new(execution_id);
        let id = job.id.clone();
        info!(job_id = %id, execution_id = %job.execution_id, "Job created");
        self.jobs.lock().await.insert(id.clone(), job);
        self.publish(&id, JobStatus::Running);
        id
    }

    /// Put a paused job back to running (its answer is being processed).
    pub async fn mark_running(&self, id: &JobId) -> Result<()> {
        self.transition(id, JobStatus::Running, |_| {}).await
    }

    pub async fn mark_awaiting_input(&self, id: &JobId, request: InteractionRequest) -> Result<()> {
        self.transition(id, JobStatus::AwaitingInput, |job| {
            job.pending_interaction = Some(request)
        })
        .await
    }

    pub async fn complete(&self, id: &JobId, report: PhaseReport) -> Result<()> {
        self.transition(id, JobStatus::Completed, |job| job.result = Some(report))
            .await
    }

    pub async fn fail(&self, id: &JobId, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.transition(id, JobStatus::Failed, |job| job.error = Some(error))
            .await
    }

    pub async fn get(&self, id: &JobId) -> Option<AsyncJob> {
        self.jobs.lock().await.get(id).cloned()
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<AsyncJob> {
        let mut jobs: Vec<AsyncJob> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// The most recent job of an execution that is waiting for input.
    pub async fn find_awaiting(&self, execution_id: &ExecutionId) -> Option<JobId> {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|j| j.execution_id == *execution_id && j.status == JobStatus::AwaitingInput)
            .max_by_key(|j| j.updated_at)
            .map(|j| j.id.clone())
    }

    /// Jobs of an execution that have not reached a terminal status.
    pub async fn unfinished_for(&self, execution_id: &ExecutionId) -> Vec<JobId> {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|j| j.execution_id == *execution_id && !j.status.is_finished())
            .map(|j| j.id.clone())
            .collect()
    }

    /// Drop finished jobs last updated longer than `older_than` ago.
    /// Returns how many were removed.
    pub async fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status.is_finished() && j.updated_at <= cutoff));
        let removed = before - jobs.len();
        if removed > 0 {
            debug!(removed, "Pruned finished jobs");
        }
        removed
    }

    async fn transition(
        &self,
        id: &JobId,
        status: JobStatus,
        apply: impl FnOnce(&mut AsyncJob),
    ) -> Result<()> {
        {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| PhaseflowError::JobNotFound(id.to_string()))?;

            if job.status.is_finished() {
                warn!(job_id = %id, status = %job.status, "Finished job cannot change status");
                return Err(PhaseflowError::InvalidState {
                    execution_id: job.execution_id.to_string(),
                    state: format!("job {}", job.status),
                });
            }

            job.set_status(status);
            apply(job);
        }
        debug!(job_id = %id, status = %status, "Job updated");
        self.publish(id, status);
        Ok(())
    }

    fn publish(&self, id: &JobId, status: JobStatus) {
        self.event_bus.publish(EngineEvent::JobUpdated {
            job_id: id.clone(),
            status: status.to_string(),
        });
    }
}
