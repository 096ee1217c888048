use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use phaseflow_core::catalog::CatalogQuestion;
use phaseflow_core::config::EngineConfig;
use phaseflow_core::context::ExecutionContext;
use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::event::EventBus;
use phaseflow_core::interaction::{InteractionRecord, InteractionRequest};
use phaseflow_core::process::{
    EngineeringProcess, PhaseReport, PhaseResult, ProcessExecution, ProcessPhase, ProcessStatus,
};
use phaseflow_core::run::{ActiveRun, RunStatus};
use phaseflow_core::traits::{
    CommandRunner, ConditionEvaluator, LlmClient, MemoryStore, QuestionCatalog, VibeCheckEvaluator,
};
use phaseflow_core::types::{EngineEvent, ExecutionId, JobId, RunId};
use phaseflow_core::vibe::{VibeCheck, VibeCheckContext};

use crate::adapters::{InMemoryCatalog, ShellCommandRunner};
use crate::bundle::ProcessBundle;
use crate::graph::{RunOutcome, RunScope, SimpleConditionEvaluator, WorkflowExecutor, WorkflowTemplate};
use crate::interaction::InteractionRegistry;
use crate::jobs::{AsyncJob, JobRegistry};
use crate::vibe::QualityGate;

/// Assembles a [`ProcessEngine`].
///
/// The language model, vibe-check evaluator and memory store are required.
/// Everything else has a default: an in-memory catalog built from the
/// registered bundles' questions, a shell command runner rooted at
/// `config.working_dir`, the simple condition evaluator, and fresh registries
/// sharing one event bus.
#[derive(Default)]
pub struct ProcessEngineBuilder {
    config: EngineConfig,
    default_tools: Vec<String>,
    llm: Option<Arc<dyn LlmClient>>,
    catalog: Option<Arc<dyn QuestionCatalog>>,
    commands: Option<Arc<dyn CommandRunner>>,
    conditions: Option<Arc<dyn ConditionEvaluator>>,
    evaluator: Option<Arc<dyn VibeCheckEvaluator>>,
    memory: Option<Arc<dyn MemoryStore>>,
    event_bus: Option<Arc<EventBus>>,
    interactions: Option<Arc<InteractionRegistry>>,
    jobs: Option<Arc<JobRegistry>>,
    processes: Vec<EngineeringProcess>,
    templates: Vec<WorkflowTemplate>,
    questions: Vec<CatalogQuestion>,
}

impl ProcessEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_default_tools(mut self, tools: Vec<String>) -> Self {
        self.default_tools = tools;
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn QuestionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_commands(mut self, commands: Arc<dyn CommandRunner>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn with_conditions(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn VibeCheckEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_interactions(mut self, interactions: Arc<InteractionRegistry>) -> Self {
        self.interactions = Some(interactions);
        self
    }

    pub fn with_jobs(mut self, jobs: Arc<JobRegistry>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_process(mut self, process: EngineeringProcess) -> Self {
        self.processes.push(process);
        self
    }

    pub fn with_template(mut self, template: WorkflowTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn with_bundle(mut self, bundle: ProcessBundle) -> Self {
        self.processes.push(bundle.process);
        self.templates.extend(bundle.templates);
        self.questions.extend(bundle.questions);
        self
    }

    pub fn build(self) -> Result<ProcessEngine> {
        let llm = self.llm.ok_or_else(|| missing("language model"))?;
        let evaluator = self.evaluator.ok_or_else(|| missing("vibe check evaluator"))?;
        let memory = self.memory.ok_or_else(|| missing("memory store"))?;

        let mut templates = HashMap::new();
        for template in self.templates {
            template.validate()?;
            if templates.contains_key(&template.name) {
                return Err(PhaseflowError::Config(format!(
                    "workflow template '{}' registered twice",
                    template.name
                )));
            }
            templates.insert(template.name.clone(), template);
        }

        let mut processes = HashMap::new();
        for process in self.processes {
            process.validate()?;
            for phase in &process.phases {
                if !templates.contains_key(&phase.workflow) {
                    return Err(PhaseflowError::InvalidProcess {
                        process: process.id.clone(),
                        reason: format!(
                            "phase '{}' references unknown workflow '{}'",
                            phase.name, phase.workflow
                        ),
                    });
                }
            }
            processes.insert(process.id.clone(), process);
        }

        let event_bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(EventBus::default()));
        let interactions = self
            .interactions
            .unwrap_or_else(|| Arc::new(InteractionRegistry::new(event_bus.clone())));
        let jobs = self
            .jobs
            .unwrap_or_else(|| Arc::new(JobRegistry::new(event_bus.clone())));
        let catalog: Arc<dyn QuestionCatalog> = match self.catalog {
            Some(catalog) => catalog,
            None => Arc::new(InMemoryCatalog::new(self.questions)),
        };
        let commands: Arc<dyn CommandRunner> = match self.commands {
            Some(commands) => commands,
            None => Arc::new(ShellCommandRunner::new(
                self.config.working_dir.clone().unwrap_or_else(|| ".".into()),
                self.config.command_timeout_secs,
            )),
        };
        let conditions: Arc<dyn ConditionEvaluator> = match self.conditions {
            Some(conditions) => conditions,
            None => Arc::new(SimpleConditionEvaluator::new()),
        };

        let executor = WorkflowExecutor::new(
            llm,
            catalog,
            commands,
            conditions,
            interactions.clone(),
            event_bus.clone(),
        )
        .with_max_node_visits(self.config.max_node_visits)
        .with_default_max_retries(self.config.default_max_retries)
        .with_default_tools(self.default_tools);

        info!(
            processes = processes.len(),
            templates = templates.len(),
            "Process engine ready"
        );

        Ok(ProcessEngine {
            processes,
            templates,
            executor,
            gate: QualityGate::new(evaluator, event_bus.clone()),
            memory,
            interactions,
            jobs,
            event_bus,
            locks: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        })
    }
}

fn missing(what: &str) -> PhaseflowError {
    PhaseflowError::Config(format!("process engine requires a {}", what))
}

/// Drives process executions phase by phase.
///
/// Each phase runs its workflow template through the [`WorkflowExecutor`];
/// a finished run goes through the phase's quality gate and the resulting
/// [`PhaseReport`] moves the execution's state machine. The execution
/// context is persisted after every transition, so a paused run can be
/// answered from a fresh process.
///
/// Operations on one execution are serialized by a per-execution lock.
pub struct ProcessEngine {
    processes: HashMap<String, EngineeringProcess>,
    templates: HashMap<String, WorkflowTemplate>,
    executor: WorkflowExecutor,
    gate: QualityGate,
    memory: Arc<dyn MemoryStore>,
    interactions: Arc<InteractionRegistry>,
    jobs: Arc<JobRegistry>,
    event_bus: Arc<EventBus>,
    locks: Mutex<HashMap<ExecutionId, Arc<Mutex<()>>>>,
    cancels: Mutex<HashMap<ExecutionId, CancellationToken>>,
}

impl ProcessEngine {
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::new()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn interactions(&self) -> &Arc<InteractionRegistry> {
        &self.interactions
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    pub fn process(&self, id: &str) -> Option<&EngineeringProcess> {
        self.processes.get(id)
    }

    pub fn template(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    /// Create an execution of `process_id` for a project/branch and start it.
    pub async fn start_execution(
        &self,
        process_id: &str,
        project_path: &str,
        branch: &str,
    ) -> Result<ProcessExecution> {
        let process = self
            .processes
            .get(process_id)
            .ok_or_else(|| PhaseflowError::ProcessNotFound(process_id.to_string()))?;

        let execution = ProcessExecution::create(process);
        let id = execution.id.clone();
        let _guard = self.lock(&id).await;

        let mut ctx = ExecutionContext::new(execution, project_path, branch);
        self.persist(&mut ctx).await?;

        let started = ctx.execution.start()?;
        ctx = ctx.with_execution(started);
        self.persist(&mut ctx).await?;

        info!(
            execution_id = %id,
            process = %process_id,
            project = %project_path,
            branch = %branch,
            phases = process.phases.len(),
            "Execution started"
        );
        self.event_bus.publish(EngineEvent::ExecutionStarted {
            execution_id: id,
            process_id: process_id.to_string(),
        });
        Ok(ctx.execution)
    }

    /// Run the current phase's workflow from its start node.
    ///
    /// Returns the phase report once the run finishes, or the pending request
    /// when it pauses. The report is not applied to the execution; call
    /// [`complete_phase`](Self::complete_phase) (or use
    /// [`run_phase`](Self::run_phase)) to move the state machine.
    pub async fn execute_phase(&self, execution_id: &ExecutionId) -> Result<PhaseResult> {
        let _guard = self.lock(execution_id).await;
        let mut ctx = self.load(execution_id).await?;
        require_in_progress(&ctx)?;
        if let Some(run) = ctx.active_run.as_ref().filter(|r| r.is_awaiting_input()) {
            return Err(PhaseflowError::InteractionPending {
                run_id: run.run_id.to_string(),
            });
        }

        let (phase, template) = self.phase_of(&ctx)?;
        let run_id = RunId::new();
        ctx.active_run = Some(ActiveRun {
            run_id: run_id.clone(),
            phase_index: phase.order,
            status: RunStatus::Running,
            pending: None,
            checkpoint: None,
            started_at: Utc::now(),
        });
        self.persist(&mut ctx).await?;

        info!(
            execution_id = %execution_id,
            run_id = %run_id,
            phase = %phase.name,
            template = %template.name,
            "Executing phase"
        );
        self.event_bus.publish(EngineEvent::RunStarted {
            execution_id: execution_id.clone(),
            run_id: run_id.clone(),
            phase: phase.name.clone(),
        });

        let scope = RunScope::new(
            execution_id.clone(),
            run_id,
            ctx.project_path.clone(),
            ctx.branch.clone(),
            phase.name.clone(),
        );
        let cancel = self.register_cancel(execution_id).await;
        let outcome = self.executor.start(template, &scope, &cancel).await;
        self.cancels.lock().await.remove(execution_id);

        match outcome {
            Ok(outcome) => self.settle(ctx, phase, template, &scope, outcome).await,
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "Phase could not start");
                ctx.active_run = None;
                self.persist(&mut ctx).await?;
                Err(e)
            }
        }
    }

    /// Answer the paused run of the current phase and continue it.
    ///
    /// A blank answer is rejected and leaves the run paused.
    pub async fn resume_phase(&self, execution_id: &ExecutionId, answer: &str) -> Result<PhaseResult> {
        let _guard = self.lock(execution_id).await;
        let mut ctx = self.load(execution_id).await?;
        require_in_progress(&ctx)?;

        let paused = match ctx.active_run.clone() {
            Some(run) if run.is_awaiting_input() => run,
            _ => {
                return Err(PhaseflowError::InvalidState {
                    execution_id: execution_id.to_string(),
                    state: format!("{} with no pending interaction", ctx.execution.status),
                })
            }
        };
        let (request, checkpoint) = match (paused.pending.clone(), paused.checkpoint.clone()) {
            (Some(request), Some(checkpoint)) => (request, checkpoint),
            _ => {
                return Err(PhaseflowError::InvalidState {
                    execution_id: execution_id.to_string(),
                    state: format!("{} without a run checkpoint", RunStatus::AwaitingInput),
                })
            }
        };

        // The registry is in-process; a context loaded from storage brings
        // its pending request back before it can be resolved.
        self.interactions
            .restore(&paused.run_id, request)
            .await?;
        let (request, response) = self.interactions.resolve(&paused.run_id, answer).await?;

        ctx.interaction_history.push(InteractionRecord {
            request,
            response: response.clone(),
        });
        ctx.active_run = Some(ActiveRun {
            status: RunStatus::Running,
            pending: None,
            checkpoint: None,
            ..paused.clone()
        });
        self.persist(&mut ctx).await?;

        let (phase, template) = self.phase_of(&ctx)?;
        let scope = RunScope::new(
            execution_id.clone(),
            paused.run_id.clone(),
            ctx.project_path.clone(),
            ctx.branch.clone(),
            phase.name.clone(),
        );
        info!(
            execution_id = %execution_id,
            run_id = %paused.run_id,
            node_id = %checkpoint.node_id,
            response_ms = response.response_time_ms,
            "Resuming phase"
        );

        let cancel = self.register_cancel(execution_id).await;
        let outcome = self
            .executor
            .resume(template, &scope, checkpoint, response, &cancel)
            .await;
        self.cancels.lock().await.remove(execution_id);

        match outcome {
            Ok(outcome) => self.settle(ctx, phase, template, &scope, outcome).await,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Resume rejected, run stays paused");
                ctx.interaction_history.pop();
                ctx.active_run = Some(paused);
                self.persist(&mut ctx).await?;
                Err(e)
            }
        }
    }

    /// Apply a phase report to the execution.
    ///
    /// A passing report completes the phase and advances to the next one (or
    /// completes the execution). A failing one leaves the execution `Failed`
    /// at the same phase, retryable with [`retry_phase`](Self::retry_phase).
    pub async fn complete_phase(
        &self,
        execution_id: &ExecutionId,
        report: PhaseReport,
    ) -> Result<ProcessExecution> {
        let _guard = self.lock(execution_id).await;
        let mut ctx = self.load(execution_id).await?;
        if let Some(run) = ctx.active_run.as_ref().filter(|r| r.is_awaiting_input()) {
            return Err(PhaseflowError::InteractionPending {
                run_id: run.run_id.to_string(),
            });
        }

        let phase_index = report.phase_index;
        let next = ctx.execution.complete_phase(&report)?;
        ctx.phase_reports.push(report);
        ctx = ctx.with_execution(next);

        if ctx.execution.status == ProcessStatus::Failed {
            let reason = ctx.execution.failure_reason.clone().unwrap_or_default();
            warn!(
                execution_id = %execution_id,
                phase_index,
                reason = %reason,
                "Phase failed"
            );
            self.persist(&mut ctx).await?;
            self.event_bus.publish(EngineEvent::PhaseFailed {
                execution_id: execution_id.clone(),
                phase_index,
                reason,
            });
            return Ok(ctx.execution);
        }

        self.persist(&mut ctx).await?;
        info!(execution_id = %execution_id, phase_index, "Phase completed");
        self.event_bus.publish(EngineEvent::PhaseCompleted {
            execution_id: execution_id.clone(),
            phase_index,
        });

        let advanced = ctx.execution.advance()?;
        ctx = ctx.with_execution(advanced);
        self.persist(&mut ctx).await?;

        if ctx.execution.status == ProcessStatus::Completed {
            self.forget(execution_id).await;
            info!(execution_id = %execution_id, "Execution completed");
            self.event_bus.publish(EngineEvent::ExecutionCompleted {
                execution_id: execution_id.clone(),
            });
        } else {
            debug!(
                execution_id = %execution_id,
                phase_index = ctx.execution.current_phase_index,
                "Advanced to next phase"
            );
        }
        Ok(ctx.execution)
    }

    /// Put a failed phase attempt back in progress.
    pub async fn retry_phase(&self, execution_id: &ExecutionId) -> Result<ProcessExecution> {
        let _guard = self.lock(execution_id).await;
        let ctx = self.load(execution_id).await?;
        let retried = ctx.execution.retry_phase()?;
        let mut ctx = ctx.with_execution(retried);
        self.persist(&mut ctx).await?;
        info!(
            execution_id = %execution_id,
            phase_index = ctx.execution.current_phase_index,
            "Retrying phase"
        );
        Ok(ctx.execution)
    }

    /// Abort the execution.
    ///
    /// An in-flight run is cancelled, dropping its current collaborator call.
    /// A pending interaction is released and every unfinished job of the
    /// execution fails with the abort reason.
    pub async fn fail_execution(
        &self,
        execution_id: &ExecutionId,
        reason: &str,
    ) -> Result<ProcessExecution> {
        self.load(execution_id).await?.execution.fail(reason)?;

        if let Some(token) = self.cancels.lock().await.get(execution_id) {
            debug!(execution_id = %execution_id, "Cancelling in-flight run");
            token.cancel();
        }
        for job_id in self.jobs.unfinished_for(execution_id).await {
            if let Err(e) = self
                .jobs
                .fail(&job_id, format!("execution aborted: {}", reason))
                .await
            {
                debug!(job_id = %job_id, error = %e, "Job finished before abort");
            }
        }

        let _guard = self.lock(execution_id).await;
        let ctx = self.load(execution_id).await?;
        let failed = ctx.execution.fail(reason)?;
        let mut ctx = ctx.with_execution(failed);

        if let Some(run) = ctx.active_run.take() {
            if let Some(request) = self.interactions.release(&run.run_id).await {
                debug!(run_id = %run.run_id, request_id = %request.id, "Released pending interaction");
            }
        }
        self.persist(&mut ctx).await?;

        self.forget(execution_id).await;

        warn!(execution_id = %execution_id, reason = %reason, "Execution aborted");
        self.event_bus.publish(EngineEvent::ExecutionFailed {
            execution_id: execution_id.clone(),
            reason: reason.to_string(),
        });
        Ok(ctx.execution)
    }

    pub async fn get_context(&self, execution_id: &ExecutionId) -> Result<ExecutionContext> {
        self.load(execution_id).await
    }

    /// The most recently updated execution for a project/branch.
    pub async fn find_for_project(
        &self,
        project_path: &str,
        branch: &str,
    ) -> Result<Option<ExecutionContext>> {
        self.memory.load(project_path, branch).await
    }

    /// Execute the current phase and apply its report if the run finished.
    pub async fn run_phase(&self, execution_id: &ExecutionId) -> Result<PhaseResult> {
        let result = self.execute_phase(execution_id).await?;
        self.apply(execution_id, result).await
    }

    /// Resume the current phase and apply its report if the run finished.
    pub async fn answer_phase(&self, execution_id: &ExecutionId, answer: &str) -> Result<PhaseResult> {
        let result = self.resume_phase(execution_id, answer).await?;
        self.apply(execution_id, result).await
    }

    /// Answer the pending interaction and return the execution as it stands
    /// afterwards: still in progress when the run paused again, otherwise
    /// with the phase report applied.
    pub async fn provide_answer(
        &self,
        execution_id: &ExecutionId,
        answer: &str,
    ) -> Result<ProcessExecution> {
        self.answer_phase(execution_id, answer).await?;
        Ok(self.load(execution_id).await?.execution)
    }

    /// Run the current phase on a background task. The job id comes back
    /// immediately; poll it with [`job`](Self::job).
    pub async fn spawn_phase(self: &Arc<Self>, execution_id: &ExecutionId) -> Result<JobId> {
        let ctx = self.load(execution_id).await?;
        require_in_progress(&ctx)?;

        let job_id = self.jobs.create(execution_id.clone()).await;
        let engine = Arc::clone(self);
        let (id, job) = (execution_id.clone(), job_id.clone());
        tokio::spawn(async move {
            let result = engine.run_phase(&id).await;
            engine.record_job(&job, result).await;
        });
        Ok(job_id)
    }

    /// Answer the pending interaction on a background task.
    ///
    /// The job that paused on this interaction is reused when there is one.
    pub async fn spawn_answer(
        self: &Arc<Self>,
        execution_id: &ExecutionId,
        answer: impl Into<String>,
    ) -> Result<JobId> {
        let answer = answer.into();
        if answer.trim().is_empty() {
            return Err(PhaseflowError::InvalidInteraction(
                "answer must not be blank".into(),
            ));
        }
        let ctx = self.load(execution_id).await?;
        if !ctx.is_awaiting_input() {
            return Err(PhaseflowError::InvalidState {
                execution_id: execution_id.to_string(),
                state: format!("{} with no pending interaction", ctx.execution.status),
            });
        }

        let job_id = match self.jobs.find_awaiting(execution_id).await {
            Some(job_id) => {
                self.jobs.mark_running(&job_id).await?;
                job_id
            }
            None => self.jobs.create(execution_id.clone()).await,
        };

        let engine = Arc::clone(self);
        let (id, job) = (execution_id.clone(), job_id.clone());
        tokio::spawn(async move {
            let result = engine.answer_phase(&id, &answer).await;
            engine.record_job(&job, result).await;
        });
        Ok(job_id)
    }

    pub async fn job(&self, job_id: &JobId) -> Result<AsyncJob> {
        self.jobs
            .get(job_id)
            .await
            .ok_or_else(|| PhaseflowError::JobNotFound(job_id.to_string()))
    }

    async fn apply(&self, execution_id: &ExecutionId, result: PhaseResult) -> Result<PhaseResult> {
        if let PhaseResult::Completed(report) = &result {
            self.complete_phase(execution_id, report.clone()).await?;
        }
        Ok(result)
    }

    async fn record_job(&self, job_id: &JobId, result: Result<PhaseResult>) {
        let recorded = match result {
            Ok(PhaseResult::Completed(report)) => self.jobs.complete(job_id, report).await,
            Ok(PhaseResult::AwaitingInput { request, .. }) => {
                self.jobs.mark_awaiting_input(job_id, request).await
            }
            // A rejected answer leaves the run paused; so does the job.
            Err(e) => match self.still_awaiting(job_id).await {
                Some(request) => {
                    debug!(job_id = %job_id, error = %e, "Answer rejected, job awaits input again");
                    self.jobs.mark_awaiting_input(job_id, request).await
                }
                None => self.jobs.fail(job_id, e.to_string()).await,
            },
        };
        if let Err(e) = recorded {
            warn!(job_id = %job_id, error = %e, "Failed to record job outcome");
        }
    }

    /// The request a job's execution is still paused on, if any.
    async fn still_awaiting(&self, job_id: &JobId) -> Option<InteractionRequest> {
        let job = self.jobs.get(job_id).await?;
        let ctx = self.load(&job.execution_id).await.ok()?;
        if ctx.execution.status != ProcessStatus::InProgress {
            return None;
        }
        ctx.active_run
            .filter(|run| run.is_awaiting_input())
            .and_then(|run| run.pending)
    }

    /// Turn a run outcome into a phase result and persist the run state.
    async fn settle(
        &self,
        mut ctx: ExecutionContext,
        phase: &ProcessPhase,
        template: &WorkflowTemplate,
        scope: &RunScope,
        outcome: RunOutcome,
    ) -> Result<PhaseResult> {
        let result = match outcome {
            RunOutcome::Paused {
                request,
                checkpoint,
            } => {
                info!(
                    execution_id = %scope.execution_id,
                    run_id = %scope.run_id,
                    node_id = %checkpoint.node_id,
                    interaction = %request.interaction_type,
                    "Phase awaiting input"
                );
                ctx.active_run = Some(ActiveRun::awaiting(
                    phase.order,
                    request.clone(),
                    checkpoint,
                ));
                self.persist(&mut ctx).await?;
                return Ok(PhaseResult::AwaitingInput {
                    run_id: scope.run_id.clone(),
                    request,
                });
            }
            RunOutcome::Finished(result) => result,
        };

        let mut vibe_checks = vec![];
        if result.success {
            let checks: Vec<VibeCheck> = phase
                .vibe_checks
                .iter()
                .chain(&template.vibe_checks)
                .cloned()
                .collect();
            let check_ctx = VibeCheckContext {
                phase_name: phase.name.clone(),
                project_path: ctx.project_path.clone(),
                branch: ctx.branch.clone(),
                summary: result.summary.clone(),
                decisions: result.decisions.clone(),
                variables: result.variables.data().clone(),
            };
            match self
                .gate
                .evaluate(&scope.execution_id, &checks, &check_ctx)
                .await
            {
                Ok(results) => vibe_checks = results,
                Err(e) => {
                    error!(execution_id = %scope.execution_id, error = %e, "Quality gate failed");
                    ctx.active_run = None;
                    self.persist(&mut ctx).await?;
                    return Err(e);
                }
            }
        }

        let report = PhaseReport {
            phase_name: phase.name.clone(),
            phase_index: phase.order,
            run_id: result.run_id,
            success: result.success,
            summary: result.summary,
            decisions: result.decisions,
            variables: result.variables.into_map(),
            vibe_checks,
            error: result.error,
            failed_node: result.failed_node,
            completed_at: Utc::now(),
        };

        ctx.active_run = None;
        self.persist(&mut ctx).await?;
        Ok(PhaseResult::Completed(report))
    }

    fn phase_of(&self, ctx: &ExecutionContext) -> Result<(&ProcessPhase, &WorkflowTemplate)> {
        let process = self
            .processes
            .get(&ctx.execution.process_id)
            .ok_or_else(|| PhaseflowError::ProcessNotFound(ctx.execution.process_id.clone()))?;
        let phase = process
            .phase(ctx.execution.current_phase_index)
            .ok_or_else(|| PhaseflowError::InvalidState {
                execution_id: ctx.execution.id.to_string(),
                state: format!(
                    "{} at phase {} of {}",
                    ctx.execution.status,
                    ctx.execution.current_phase_index,
                    process.phases.len()
                ),
            })?;
        let template = self
            .templates
            .get(&phase.workflow)
            .ok_or_else(|| PhaseflowError::TemplateNotFound(phase.workflow.clone()))?;
        Ok((phase, template))
    }

    async fn load(&self, execution_id: &ExecutionId) -> Result<ExecutionContext> {
        self.memory
            .find_by_execution_id(execution_id)
            .await?
            .ok_or_else(|| PhaseflowError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn persist(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.touch();
        self.memory.save(ctx).await
    }

    async fn lock(&self, execution_id: &ExecutionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(execution_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock of a finished execution.
    async fn forget(&self, execution_id: &ExecutionId) {
        self.locks.lock().await.remove(execution_id);
    }

    async fn register_cancel(&self, execution_id: &ExecutionId) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancels
            .lock()
            .await
            .insert(execution_id.clone(), token.clone());
        token
    }
}

fn require_in_progress(ctx: &ExecutionContext) -> Result<()> {
    if ctx.execution.status == ProcessStatus::InProgress {
        Ok(())
    } else {
        Err(PhaseflowError::InvalidState {
            execution_id: ctx.execution.id.to_string(),
            state: ctx.execution.status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use phaseflow_core::interaction::InteractionType;
    use phaseflow_memory::InMemoryStore;
    use phaseflow_test_utils::{fixtures, FixedVibeEvaluator, ScriptedLlm};

    use crate::graph::{WorkflowEdge, WorkflowNode};
    use crate::jobs::JobStatus;

    fn linear(name: &str, prompts: &[&str]) -> WorkflowTemplate {
        WorkflowTemplate::from_json(&fixtures::linear_template_json(name, prompts)).unwrap()
    }

    fn interview() -> WorkflowTemplate {
        WorkflowTemplate::new(
            "interview",
            vec![
                WorkflowNode::start("start"),
                WorkflowNode::human("ask", "Which module should change?", "module"),
                WorkflowNode::llm("plan", "Plan changes to {{module}}", "plan"),
                WorkflowNode::end("end"),
            ],
            "start",
            "end",
            vec![
                WorkflowEdge::new("start", "ask"),
                WorkflowEdge::new("ask", "plan"),
                WorkflowEdge::new("plan", "end"),
            ],
        )
    }

    fn engine_with(
        evaluator: FixedVibeEvaluator,
        process: EngineeringProcess,
        templates: Vec<WorkflowTemplate>,
    ) -> Arc<ProcessEngine> {
        let mut builder = ProcessEngine::builder()
            .with_llm(Arc::new(ScriptedLlm::echo()))
            .with_evaluator(Arc::new(evaluator))
            .with_memory(Arc::new(InMemoryStore::new()))
            .with_process(process);
        for template in templates {
            builder = builder.with_template(template);
        }
        Arc::new(builder.build().unwrap())
    }

    fn two_phase_engine(evaluator: FixedVibeEvaluator) -> Arc<ProcessEngine> {
        let process = fixtures::process(
            "feature",
            vec![
                fixtures::phase("Design", "design", 0, vec![VibeCheck::required("Design reviewed?")]),
                fixtures::phase("Build", "build", 1, vec![VibeCheck::optional("Docs updated?")]),
            ],
        );
        engine_with(
            evaluator,
            process,
            vec![linear("design", &["Draft"]), linear("build", &["Implement"])],
        )
    }

    fn interview_engine() -> Arc<ProcessEngine> {
        let process = fixtures::process(
            "interview",
            vec![fixtures::phase("Discovery", "interview", 0, vec![])],
        );
        engine_with(FixedVibeEvaluator::passing(), process, vec![interview()])
    }

    async fn wait_for_job(engine: &ProcessEngine, job_id: &JobId) -> AsyncJob {
        for _ in 0..200 {
            let job = engine.job(job_id).await.unwrap();
            if job.status != JobStatus::Running {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never left RUNNING", job_id);
    }

    #[tokio::test]
    async fn test_start_execution_persists_in_progress() {
        let engine = two_phase_engine(FixedVibeEvaluator::passing());
        let exec = engine.start_execution("feature", "/repo", "main").await.unwrap();
        assert_eq!(exec.status, ProcessStatus::InProgress);
        assert_eq!(exec.current_phase_index, 0);

        let found = engine.find_for_project("/repo", "main").await.unwrap().unwrap();
        assert_eq!(found.execution.id, exec.id);
    }

    #[tokio::test]
    async fn test_unknown_process_and_execution() {
        let engine = two_phase_engine(FixedVibeEvaluator::passing());
        assert!(matches!(
            engine.start_execution("nope", "/repo", "main").await,
            Err(PhaseflowError::ProcessNotFound(_))
        ));
        assert!(matches!(
            engine.execute_phase(&ExecutionId::new()).await,
            Err(PhaseflowError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_passing_phases_advance_to_completion() {
        let engine = two_phase_engine(FixedVibeEvaluator::passing().with_verdict(
            "Docs updated?",
            false,
            "stale README",
        ));
        let exec = engine.start_execution("feature", "/repo", "main").await.unwrap();

        let first = engine.run_phase(&exec.id).await.unwrap();
        let report = first.report().unwrap();
        assert!(report.success);
        assert_eq!(report.vibe_checks.len(), 1);
        let ctx = engine.get_context(&exec.id).await.unwrap();
        assert_eq!(ctx.execution.status, ProcessStatus::InProgress);
        assert_eq!(ctx.execution.current_phase_index, 1);

        // The optional check fails but does not block.
        engine.run_phase(&exec.id).await.unwrap();
        let ctx = engine.get_context(&exec.id).await.unwrap();
        assert_eq!(ctx.execution.status, ProcessStatus::Completed);
        assert!(ctx.execution.completed_at.is_some());
        assert_eq!(ctx.phase_reports.len(), 2);
        assert!(ctx.active_run.is_none());
    }

    #[tokio::test]
    async fn test_required_check_failure_keeps_phase_and_allows_retry() {
        let engine = two_phase_engine(FixedVibeEvaluator::passing().with_verdict(
            "Design reviewed?",
            false,
            "no reviewer",
        ));
        let exec = engine.start_execution("feature", "/repo", "main").await.unwrap();
        engine.run_phase(&exec.id).await.unwrap();

        let ctx = engine.get_context(&exec.id).await.unwrap();
        assert_eq!(ctx.execution.status, ProcessStatus::Failed);
        assert_eq!(ctx.execution.current_phase_index, 0);
        assert!(ctx
            .execution
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("Design reviewed?"));

        // A failed phase attempt can't run until retried.
        assert!(engine.execute_phase(&exec.id).await.unwrap_err().is_invalid_state());

        let retried = engine.retry_phase(&exec.id).await.unwrap();
        assert_eq!(retried.status, ProcessStatus::InProgress);
        assert_eq!(retried.current_phase_index, 0);
    }

    #[tokio::test]
    async fn test_human_answer_resumes_run() {
        let engine = interview_engine();
        let exec = engine.start_execution("interview", "/repo", "main").await.unwrap();

        let paused = engine.execute_phase(&exec.id).await.unwrap();
        let request = paused.request().unwrap().clone();
        assert_eq!(request.interaction_type, InteractionType::AskUser);
        assert!(engine.get_context(&exec.id).await.unwrap().is_awaiting_input());

        // Pending input blocks a second run and a report.
        assert!(matches!(
            engine.execute_phase(&exec.id).await,
            Err(PhaseflowError::InteractionPending { .. })
        ));

        let exec_after = engine.provide_answer(&exec.id, "billing").await.unwrap();
        assert_eq!(exec_after.status, ProcessStatus::Completed);

        let ctx = engine.get_context(&exec.id).await.unwrap();
        assert_eq!(ctx.interaction_history.len(), 1);
        assert_eq!(ctx.interaction_history[0].request.id, request.id);
        assert_eq!(ctx.interaction_history[0].response.answer, "billing");
        assert!(ctx.phase_reports[0].summary.contains("billing"));
        assert!(ctx.active_run.is_none());
    }

    #[tokio::test]
    async fn test_resume_without_pending_interaction_is_invalid_state() {
        let engine = two_phase_engine(FixedVibeEvaluator::passing());
        let exec = engine.start_execution("feature", "/repo", "main").await.unwrap();
        let err = engine.resume_phase(&exec.id, "anything").await.unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn test_blank_answer_keeps_run_paused() {
        let engine = interview_engine();
        let exec = engine.start_execution("interview", "/repo", "main").await.unwrap();
        engine.execute_phase(&exec.id).await.unwrap();

        let err = engine.resume_phase(&exec.id, "   ").await.unwrap_err();
        assert!(matches!(err, PhaseflowError::InvalidInteraction(_)));

        let ctx = engine.get_context(&exec.id).await.unwrap();
        assert!(ctx.is_awaiting_input());
        assert!(ctx.interaction_history.is_empty());
    }

    #[tokio::test]
    async fn test_abort_releases_pending_interaction() {
        let engine = interview_engine();
        let mut rx = engine.event_bus().subscribe();
        let exec = engine.start_execution("interview", "/repo", "main").await.unwrap();
        let paused = engine.execute_phase(&exec.id).await.unwrap();
        let PhaseResult::AwaitingInput { run_id, .. } = paused else {
            panic!("expected a paused phase");
        };

        let failed = engine.fail_execution(&exec.id, "operator abort").await.unwrap();
        assert!(failed.is_aborted());
        assert!(!engine.interactions().is_awaiting(&run_id).await);

        let ctx = engine.get_context(&exec.id).await.unwrap();
        assert!(ctx.active_run.is_none());
        assert!(engine.retry_phase(&exec.id).await.unwrap_err().is_invalid_state());
        assert!(engine.resume_phase(&exec.id, "late").await.unwrap_err().is_invalid_state());

        let mut released = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::InteractionReleased { .. }) {
                released = true;
            }
        }
        assert!(released);
    }

    #[tokio::test]
    async fn test_abort_fails_paused_job() {
        let engine = interview_engine();
        let exec = engine.start_execution("interview", "/repo", "main").await.unwrap();
        let job_id = engine.spawn_phase(&exec.id).await.unwrap();
        assert_eq!(wait_for_job(&engine, &job_id).await.status, JobStatus::AwaitingInput);

        engine.fail_execution(&exec.id, "operator abort").await.unwrap();

        let job = engine.job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.pending_interaction.is_none());
        assert!(job.error.unwrap().contains("operator abort"));
        assert_eq!(engine.jobs().prune_finished(chrono::Duration::zero()).await, 1);
    }

    #[tokio::test]
    async fn test_abort_interrupts_running_phase() {
        let llm = Arc::new(ScriptedLlm::echo().with_delay(Duration::from_secs(30)));
        let process = fixtures::process("slow", vec![fixtures::phase("Build", "slow", 0, vec![])]);
        let engine = Arc::new(
            ProcessEngine::builder()
                .with_llm(llm.clone())
                .with_evaluator(Arc::new(FixedVibeEvaluator::passing()))
                .with_memory(Arc::new(InMemoryStore::new()))
                .with_process(process)
                .with_template(linear("slow", &["first step", "second step"]))
                .build()
                .unwrap(),
        );
        let exec = engine.start_execution("slow", "/repo", "main").await.unwrap();
        let job_id = engine.spawn_phase(&exec.id).await.unwrap();

        for _ in 0..200 {
            if !llm.prompts().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(llm.prompts(), vec!["first step"]);

        let aborted = tokio::time::timeout(
            Duration::from_secs(5),
            engine.fail_execution(&exec.id, "stop"),
        )
        .await
        .expect("abort does not wait for the slow call")
        .unwrap();
        assert!(aborted.is_aborted());

        let job = wait_for_job(&engine, &job_id).await;
        assert_eq!(job.status, JobStatus::Failed);

        // Let the background task settle, then check nothing else ran.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(llm.prompts(), vec!["first step"]);
        let ctx = engine.get_context(&exec.id).await.unwrap();
        assert!(ctx.execution.is_aborted());
        assert_eq!(ctx.execution.failure_reason.as_deref(), Some("stop"));
        assert!(ctx.active_run.is_none());
    }

    #[tokio::test]
    async fn test_blank_async_answer_is_rejected_up_front() {
        let engine = interview_engine();
        let exec = engine.start_execution("interview", "/repo", "main").await.unwrap();
        let job_id = engine.spawn_phase(&exec.id).await.unwrap();
        wait_for_job(&engine, &job_id).await;

        let err = engine.spawn_answer(&exec.id, "   ").await.unwrap_err();
        assert!(matches!(err, PhaseflowError::InvalidInteraction(_)));
        let job = engine.job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::AwaitingInput);
        assert!(job.pending_interaction.is_some());
    }

    #[tokio::test]
    async fn test_rejected_answer_returns_job_to_awaiting_input() {
        let engine = interview_engine();
        let exec = engine.start_execution("interview", "/repo", "main").await.unwrap();
        let job_id = engine.spawn_phase(&exec.id).await.unwrap();
        wait_for_job(&engine, &job_id).await;

        engine.jobs().mark_running(&job_id).await.unwrap();
        engine
            .record_job(
                &job_id,
                Err(PhaseflowError::InvalidInteraction("answer out of range".into())),
            )
            .await;

        let job = engine.job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::AwaitingInput);
        assert!(job.error.is_none());
        assert!(engine.get_context(&exec.id).await.unwrap().is_awaiting_input());
    }

    #[tokio::test]
    async fn test_finished_executions_release_their_lock() {
        let engine = two_phase_engine(FixedVibeEvaluator::passing());
        let done = engine.start_execution("feature", "/repo", "main").await.unwrap();
        engine.run_phase(&done.id).await.unwrap();
        engine.run_phase(&done.id).await.unwrap();
        let aborted = engine.start_execution("feature", "/repo", "dev").await.unwrap();
        engine.fail_execution(&aborted.id, "dropped").await.unwrap();

        assert!(engine.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_jobs_follow_the_phase() {
        let engine = interview_engine();
        let exec = engine.start_execution("interview", "/repo", "main").await.unwrap();

        let job_id = engine.spawn_phase(&exec.id).await.unwrap();
        let job = wait_for_job(&engine, &job_id).await;
        assert_eq!(job.status, JobStatus::AwaitingInput);
        assert!(job.pending_interaction.is_some());

        let answer_job = engine.spawn_answer(&exec.id, "search").await.unwrap();
        assert_eq!(answer_job, job_id);
        let job = wait_for_job(&engine, &job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result.unwrap().summary.contains("search"));
    }

    #[tokio::test]
    async fn test_spawn_answer_requires_pending_interaction() {
        let engine = interview_engine();
        let exec = engine.start_execution("interview", "/repo", "main").await.unwrap();
        assert!(engine
            .spawn_answer(&exec.id, "x")
            .await
            .unwrap_err()
            .is_invalid_state());
        assert!(matches!(
            engine.job(&JobId::new()).await,
            Err(PhaseflowError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = ProcessEngine::builder()
            .with_evaluator(Arc::new(FixedVibeEvaluator::passing()))
            .with_memory(Arc::new(InMemoryStore::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("language model"));
    }

    #[test]
    fn test_builder_rejects_unknown_workflow() {
        let process = fixtures::process(
            "feature",
            vec![fixtures::phase("Design", "missing", 0, vec![])],
        );
        let err = ProcessEngine::builder()
            .with_llm(Arc::new(ScriptedLlm::echo()))
            .with_evaluator(Arc::new(FixedVibeEvaluator::passing()))
            .with_memory(Arc::new(InMemoryStore::new()))
            .with_process(process)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PhaseflowError::InvalidProcess { .. }));
    }
}
