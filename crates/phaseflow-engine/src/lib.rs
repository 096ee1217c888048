pub mod adapters;
pub mod bundle;
pub mod graph;
pub mod interaction;
pub mod jobs;
pub mod orchestrator;
pub mod run_log;
pub mod vibe;

pub use adapters::{CommandLlmClient, InMemoryCatalog, ShellCommandRunner};
pub use bundle::ProcessBundle;
pub use graph::{
    RunOutcome, RunScope, SimpleConditionEvaluator, WorkflowEdge, WorkflowExecutor, WorkflowNode,
    WorkflowResult, WorkflowTemplate,
};
pub use interaction::InteractionRegistry;
pub use jobs::{AsyncJob, JobRegistry, JobStatus};
pub use orchestrator::{ProcessEngine, ProcessEngineBuilder};
pub use run_log::RunLogger;
pub use vibe::{AutoPassEvaluator, LlmVibeEvaluator, QualityGate};
