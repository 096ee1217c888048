use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhaseflowError {
    // Template errors
    #[error("Invalid workflow template '{template}': {}", issues.join("; "))]
    InvalidTemplate { template: String, issues: Vec<String> },

    #[error("Invalid process '{process}': {reason}")]
    InvalidProcess { process: String, reason: String },

    #[error("Workflow template not found: {0}")]
    TemplateNotFound(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    // Traversal errors
    #[error("Node '{0}' not found in workflow graph")]
    NodeNotFound(String),

    #[error("No outgoing edge from node '{node_id}'")]
    NoOutgoingEdge { node_id: String },

    #[error("Infinite loop suspected at node '{node_id}' after {visits} node visits")]
    InfiniteLoop { node_id: String, visits: usize },

    #[error("Workflow run cancelled")]
    Cancelled,

    // Node execution errors
    #[error("Node '{node_id}' failed: {message}")]
    NodeFailed { node_id: String, message: String },

    #[error("Answer for question '{question_id}' rejected after {attempts} attempts: {reason}")]
    AnswerRejected {
        question_id: String,
        attempts: u32,
        reason: String,
    },

    // Interaction-state errors
    #[error("Execution {execution_id} is in state {state}, which does not allow this operation")]
    InvalidState { execution_id: String, state: String },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Run {run_id} already has a pending interaction")]
    InteractionPending { run_id: String },

    #[error("Invalid interaction: {0}")]
    InvalidInteraction(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    // Collaborator errors
    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("Command failed: {command}: {message}")]
    Command { command: String, message: String },

    #[error("Command timeout after {timeout_secs}s: {command}")]
    CommandTimeout { command: String, timeout_secs: u64 },

    #[error("Question catalog error: {0}")]
    Catalog(String),

    #[error("Condition evaluation failed for '{expr}': {message}")]
    Condition { expr: String, message: String },

    #[error("Vibe check evaluation failed: {0}")]
    Evaluator(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PhaseflowError {
    /// The node a traversal or node failure is attributed to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeNotFound(id) => Some(id),
            Self::NoOutgoingEdge { node_id }
            | Self::InfiniteLoop { node_id, .. }
            | Self::NodeFailed { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Whether this error is a caller error about interaction or execution state.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::ExecutionNotFound(_)
                | Self::InteractionPending { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PhaseflowError>;
