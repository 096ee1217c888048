use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::interaction::InteractionRequest;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_str(s: &str) -> Self {
                Self(s.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Unique identifier of one `ProcessExecution`.
    ExecutionId
);

string_id!(
    /// Unique identifier of one workflow run (one phase attempt).
    RunId
);

string_id!(
    /// Unique identifier of an async job.
    JobId
);

/// Event broadcast to all engine subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A process execution was created and started.
    ExecutionStarted {
        execution_id: ExecutionId,
        process_id: String,
    },
    /// A workflow run started for a phase.
    RunStarted {
        execution_id: ExecutionId,
        run_id: RunId,
        phase: String,
    },
    /// A node started executing.
    NodeStarted { run_id: RunId, node_id: String },
    /// A node finished executing.
    NodeCompleted {
        run_id: RunId,
        node_id: String,
        succeeded: bool,
    },
    /// A node issued an interaction request and the run paused.
    InteractionRequested {
        run_id: RunId,
        request: InteractionRequest,
    },
    /// A pending interaction was answered.
    InteractionResolved { run_id: RunId, request_id: String },
    /// A pending interaction was released without an answer (abort).
    InteractionReleased { run_id: RunId, request_id: String },
    /// A workflow run reached its end node.
    RunCompleted { run_id: RunId, steps: usize },
    /// A workflow run failed.
    RunFailed {
        run_id: RunId,
        node_id: Option<String>,
        error: String,
    },
    /// A vibe check produced a result.
    VibeCheckEvaluated {
        execution_id: ExecutionId,
        question: String,
        required: bool,
        passed: bool,
    },
    /// A phase passed its quality gate.
    PhaseCompleted {
        execution_id: ExecutionId,
        phase_index: usize,
    },
    /// A phase attempt failed.
    PhaseFailed {
        execution_id: ExecutionId,
        phase_index: usize,
        reason: String,
    },
    /// Every phase completed.
    ExecutionCompleted { execution_id: ExecutionId },
    /// The execution was aborted.
    ExecutionFailed {
        execution_id: ExecutionId,
        reason: String,
    },
    /// An async job changed status.
    JobUpdated { job_id: JobId, status: String },
}

impl EngineEvent {
    /// Short snake_case name used by the JSONL run log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::RunStarted { .. } => "run_started",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::InteractionRequested { .. } => "interaction_requested",
            Self::InteractionResolved { .. } => "interaction_resolved",
            Self::InteractionReleased { .. } => "interaction_released",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::VibeCheckEvaluated { .. } => "vibe_check_evaluated",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::PhaseFailed { .. } => "phase_failed",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::JobUpdated { .. } => "job_updated",
        }
    }
}
