use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PhaseflowError, Result};
use crate::interaction::InteractionRequest;
use crate::run::Decision;
use crate::types::{ExecutionId, RunId};
use crate::vibe::{GateSummary, VibeCheck, VibeCheckResult};

/// One ordered stage of an engineering process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessPhase {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Name of the workflow template this phase runs.
    pub workflow: String,
    #[serde(default)]
    pub vibe_checks: Vec<VibeCheck>,
    /// Zero-based position within the process.
    pub order: usize,
}

/// An ordered set of phases, e.g. "Feature Development".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineeringProcess {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<ProcessPhase>,
}

impl EngineeringProcess {
    /// At least one phase, and phase orders are exactly `0..n-1` in list order.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| PhaseflowError::InvalidProcess {
            process: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("process id must not be blank".into()));
        }
        if self.phases.is_empty() {
            return Err(invalid("process has no phases".into()));
        }
        for (index, phase) in self.phases.iter().enumerate() {
            if phase.order != index {
                return Err(invalid(format!(
                    "phase '{}' has order {} but sits at position {}",
                    phase.name, phase.order, index
                )));
            }
            if phase.name.trim().is_empty() {
                return Err(invalid(format!("phase {} has a blank name", index)));
            }
            if phase.workflow.trim().is_empty() {
                return Err(invalid(format!(
                    "phase '{}' does not reference a workflow template",
                    phase.name
                )));
            }
        }
        Ok(())
    }

    pub fn phase(&self, index: usize) -> Option<&ProcessPhase> {
        self.phases.get(index)
    }
}

/// Status of a `ProcessExecution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Created,
    InProgress,
    PhaseCompleted,
    Completed,
    Failed,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::InProgress => "IN_PROGRESS",
            Self::PhaseCompleted => "PHASE_COMPLETED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// One run of a process against a project/branch.
///
/// Values are never mutated in place: every transition returns a new
/// `ProcessExecution`, leaving the receiver untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExecution {
    pub id: ExecutionId,
    pub process_id: String,
    pub status: ProcessStatus,
    pub current_phase_index: usize,
    pub phase_count: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the current phase attempt (or the whole execution) failed.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl ProcessExecution {
    pub fn create(process: &EngineeringProcess) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::new(),
            process_id: process.id.clone(),
            status: ProcessStatus::Created,
            current_phase_index: 0,
            phase_count: process.phases.len(),
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            failure_reason: None,
        }
    }

    /// `CREATED -> IN_PROGRESS`.
    pub fn start(&self) -> Result<Self> {
        self.expect_status(ProcessStatus::Created)?;
        let now = Utc::now();
        Ok(Self {
            status: ProcessStatus::InProgress,
            started_at: Some(now),
            updated_at: now,
            ..self.clone()
        })
    }

    /// `IN_PROGRESS -> PHASE_COMPLETED` when the run succeeded and every
    /// required vibe check passed, otherwise `IN_PROGRESS -> FAILED` with the
    /// phase index unchanged.
    pub fn complete_phase(&self, report: &PhaseReport) -> Result<Self> {
        self.expect_status(ProcessStatus::InProgress)?;
        if report.phase_index != self.current_phase_index {
            return Err(PhaseflowError::InvalidState {
                execution_id: self.id.to_string(),
                state: format!(
                    "{} at phase {} (report is for phase {})",
                    self.status, self.current_phase_index, report.phase_index
                ),
            });
        }

        let now = Utc::now();
        match report.failure_reason() {
            None => Ok(Self {
                status: ProcessStatus::PhaseCompleted,
                updated_at: now,
                failure_reason: None,
                ..self.clone()
            }),
            Some(reason) => Ok(Self {
                status: ProcessStatus::Failed,
                updated_at: now,
                failure_reason: Some(reason),
                ..self.clone()
            }),
        }
    }

    /// `PHASE_COMPLETED -> IN_PROGRESS` on the next phase, or
    /// `PHASE_COMPLETED -> COMPLETED` after the last one.
    pub fn advance(&self) -> Result<Self> {
        self.expect_status(ProcessStatus::PhaseCompleted)?;
        let now = Utc::now();
        if self.current_phase_index + 1 < self.phase_count {
            Ok(Self {
                status: ProcessStatus::InProgress,
                current_phase_index: self.current_phase_index + 1,
                updated_at: now,
                ..self.clone()
            })
        } else {
            Ok(Self {
                status: ProcessStatus::Completed,
                updated_at: now,
                completed_at: Some(now),
                ..self.clone()
            })
        }
    }

    /// `FAILED -> IN_PROGRESS` on the same phase. Not allowed once the
    /// execution has been aborted.
    pub fn retry_phase(&self) -> Result<Self> {
        self.expect_status(ProcessStatus::Failed)?;
        if self.is_aborted() {
            return Err(self.invalid_state());
        }
        Ok(Self {
            status: ProcessStatus::InProgress,
            updated_at: Utc::now(),
            failure_reason: None,
            ..self.clone()
        })
    }

    /// Abort the whole execution: `FAILED` with a completion timestamp.
    pub fn fail(&self, reason: impl Into<String>) -> Result<Self> {
        if self.status == ProcessStatus::Completed || self.is_aborted() {
            return Err(self.invalid_state());
        }
        let now = Utc::now();
        Ok(Self {
            status: ProcessStatus::Failed,
            updated_at: now,
            completed_at: Some(now),
            failure_reason: Some(reason.into()),
            ..self.clone()
        })
    }

    /// Failed with a completion timestamp: the execution is over.
    pub fn is_aborted(&self) -> bool {
        self.status == ProcessStatus::Failed && self.completed_at.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.status == ProcessStatus::Completed || self.is_aborted()
    }

    fn expect_status(&self, expected: ProcessStatus) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(self.invalid_state())
        }
    }

    fn invalid_state(&self) -> PhaseflowError {
        PhaseflowError::InvalidState {
            execution_id: self.id.to_string(),
            state: self.status.to_string(),
        }
    }
}

/// Outcome of one phase's workflow run plus its vibe checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase_name: String,
    pub phase_index: usize,
    pub run_id: RunId,
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub vibe_checks: Vec<VibeCheckResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failed_node: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl PhaseReport {
    pub fn gate(&self) -> GateSummary {
        GateSummary::from_results(&self.vibe_checks)
    }

    /// `None` when the phase may advance; otherwise a reason naming the
    /// failed node or the failed required checks.
    pub fn failure_reason(&self) -> Option<String> {
        if !self.success {
            let error = self.error.as_deref().unwrap_or("workflow run failed");
            return Some(match &self.failed_node {
                Some(node) => format!("workflow failed at node '{}': {}", node, error),
                None => format!("workflow failed: {}", error),
            });
        }
        let gate = self.gate();
        if gate.passed {
            None
        } else {
            Some(format!(
                "required vibe checks failed: {}",
                gate.required_failures.join("; ")
            ))
        }
    }
}

/// What `execute_phase` hands back: a finished report or a paused run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PhaseResult {
    Completed(PhaseReport),
    AwaitingInput {
        run_id: RunId,
        request: InteractionRequest,
    },
}

impl PhaseResult {
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::AwaitingInput { .. })
    }

    pub fn report(&self) -> Option<&PhaseReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::AwaitingInput { .. } => None,
        }
    }

    pub fn request(&self) -> Option<&InteractionRequest> {
        match self {
            Self::Completed(_) => None,
            Self::AwaitingInput { request, .. } => Some(request),
        }
    }
}
