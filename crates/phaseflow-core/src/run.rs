use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::interaction::InteractionRequest;
use crate::types::RunId;

/// Status of one in-flight workflow run.
///
/// `Running -> AwaitingInput -> Running -> Completed | Failed`. Answers are
/// only accepted from `AwaitingInput`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    AwaitingInput,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::AwaitingInput => write!(f, "AWAITING_INPUT"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A decision recorded by a node during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub node_id: String,
    pub description: String,
    pub output: String,
    pub recorded_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(
        node_id: impl Into<String>,
        description: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            description: description.into(),
            output: output.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Everything needed to re-enter the engine where a run paused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_id: RunId,
    pub template: String,
    /// Node that issued the pending interaction; execution resumes here.
    pub node_id: String,
    pub variables: HashMap<String, serde_json::Value>,
    pub decisions: Vec<Decision>,
    /// Node visits consumed so far.
    pub steps: usize,
    /// Rejected answers per node, for catalog-question retry budgets.
    #[serde(default)]
    pub attempts: HashMap<String, u32>,
    /// Id of the request the checkpointed node is waiting on.
    pub awaiting_request: String,
    pub saved_at: DateTime<Utc>,
}

/// The workflow run currently attached to an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRun {
    pub run_id: RunId,
    pub phase_index: usize,
    pub status: RunStatus,
    #[serde(default)]
    pub pending: Option<InteractionRequest>,
    #[serde(default)]
    pub checkpoint: Option<RunCheckpoint>,
    pub started_at: DateTime<Utc>,
}

impl ActiveRun {
    pub fn awaiting(
        phase_index: usize,
        request: InteractionRequest,
        checkpoint: RunCheckpoint,
    ) -> Self {
        Self {
            run_id: checkpoint.run_id.clone(),
            phase_index,
            status: RunStatus::AwaitingInput,
            pending: Some(request),
            checkpoint: Some(checkpoint),
            started_at: Utc::now(),
        }
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.status == RunStatus::AwaitingInput && self.pending.is_some()
    }
}
