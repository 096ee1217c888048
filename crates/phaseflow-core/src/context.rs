use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::interaction::InteractionRecord;
use crate::process::{PhaseReport, ProcessExecution};
use crate::run::ActiveRun;

/// The unit persisted by a `MemoryStore` after every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution: ProcessExecution,
    pub project_path: String,
    pub branch: String,
    /// Reports of finished phase attempts, oldest first.
    #[serde(default)]
    pub phase_reports: Vec<PhaseReport>,
    #[serde(default)]
    pub interaction_history: Vec<InteractionRecord>,
    #[serde(default)]
    pub active_run: Option<ActiveRun>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        execution: ProcessExecution,
        project_path: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            execution,
            project_path: project_path.into(),
            branch: branch.into(),
            phase_reports: vec![],
            interaction_history: vec![],
            active_run: None,
            updated_at: Utc::now(),
        }
    }

    /// Replace the execution with the result of a transition.
    pub fn with_execution(mut self, execution: ProcessExecution) -> Self {
        self.execution = execution;
        self.updated_at = Utc::now();
        self
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.active_run
            .as_ref()
            .is_some_and(|run| run.is_awaiting_input())
    }

    /// The most recent report for the execution's current phase.
    pub fn latest_report(&self) -> Option<&PhaseReport> {
        self.phase_reports
            .iter()
            .rev()
            .find(|r| r.phase_index == self.execution.current_phase_index)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
