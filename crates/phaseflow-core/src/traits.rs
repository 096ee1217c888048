use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::catalog::CatalogQuestion;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::ExecutionId;
use crate::vibe::{VibeCheck, VibeCheckContext, VibeCheckResult};

/// Language-model collaborator.
pub trait LlmClient: Send + Sync + 'static {
    /// Complete a fully rendered prompt, optionally exposing named tools.
    fn complete<'a>(&'a self, prompt: &'a str, tools: &'a [String])
        -> BoxFuture<'a, Result<String>>;
}

/// Source of canonical, pre-approved questions.
pub trait QuestionCatalog: Send + Sync + 'static {
    fn get_question<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<CatalogQuestion>>;
}

/// Output of an external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

impl CommandOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Runs external commands. Implementations own their timeouts.
pub trait CommandRunner: Send + Sync + 'static {
    fn run<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandOutput>>;
}

/// Evaluates conditional-node and edge-guard expressions against the run's
/// variables. The expression language belongs to the implementation.
pub trait ConditionEvaluator: Send + Sync + 'static {
    fn evaluate<'a>(
        &'a self,
        expr: &'a str,
        variables: &'a HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'a, Result<bool>>;
}

/// Quality-gate evaluation strategy (console, automatic, AI-assisted).
pub trait VibeCheckEvaluator: Send + Sync + 'static {
    fn evaluate<'a>(
        &'a self,
        check: &'a VibeCheck,
        context: &'a VibeCheckContext,
    ) -> BoxFuture<'a, Result<VibeCheckResult>>;

    /// Evaluate every check, returning results in input order.
    fn evaluate_batch<'a>(
        &'a self,
        checks: &'a [VibeCheck],
        context: &'a VibeCheckContext,
    ) -> BoxFuture<'a, Result<Vec<VibeCheckResult>>> {
        Box::pin(async move {
            let mut results = Vec::with_capacity(checks.len());
            for check in checks {
                results.push(self.evaluate(check, context).await?);
            }
            Ok(results)
        })
    }
}

/// Persistence for execution contexts.
pub trait MemoryStore: Send + Sync + 'static {
    /// Insert or replace the context keyed by its execution id.
    fn save<'a>(&'a self, context: &'a ExecutionContext) -> BoxFuture<'a, Result<()>>;

    /// Most recently updated context for a project/branch pair.
    fn load<'a>(
        &'a self,
        project_path: &'a str,
        branch: &'a str,
    ) -> BoxFuture<'a, Result<Option<ExecutionContext>>>;

    fn find_by_execution_id<'a>(
        &'a self,
        id: &'a ExecutionId,
    ) -> BoxFuture<'a, Result<Option<ExecutionContext>>>;

    /// Returns true if a context was removed.
    fn delete<'a>(&'a self, id: &'a ExecutionId) -> BoxFuture<'a, Result<bool>>;
}
