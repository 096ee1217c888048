use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use phaseflow_core::catalog::{validate_answer, CatalogQuestion};
use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::event::EventBus;
use phaseflow_core::interaction::{interpret_approval, InteractionRequest, InteractionResponse};
use phaseflow_core::run::{Decision, RunCheckpoint};
use phaseflow_core::traits::{CommandRunner, ConditionEvaluator, LlmClient, QuestionCatalog};
use phaseflow_core::types::{EngineEvent, ExecutionId, RunId};

use super::node::{NodeKind, WorkflowNode};
use super::state::ExecutionState;
use super::template::WorkflowTemplate;
use crate::interaction::InteractionRegistry;

/// Longest decision output echoed into a run summary.
const SUMMARY_OUTPUT_CHARS: usize = 200;

/// Fixed fields a run's prompts can reference besides its variables.
#[derive(Debug, Clone)]
pub struct RunScope {
    pub execution_id: ExecutionId,
    pub run_id: RunId,
    pub project_path: String,
    pub branch: String,
    pub phase: String,
}

impl RunScope {
    pub fn new(
        execution_id: ExecutionId,
        run_id: RunId,
        project_path: impl Into<String>,
        branch: impl Into<String>,
        phase: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            run_id,
            project_path: project_path.into(),
            branch: branch.into(),
            phase: phase.into(),
        }
    }

    fn fields(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("project_path", self.project_path.clone()),
            ("branch", self.branch.clone()),
            ("phase", self.phase.clone()),
            ("execution_id", self.execution_id.to_string()),
            ("run_id", self.run_id.to_string()),
        ])
    }
}

/// Result of a run that reached its end node or failed.
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub run_id: RunId,
    pub success: bool,
    pub summary: String,
    /// Decisions in traversal order.
    pub decisions: Vec<Decision>,
    pub variables: ExecutionState,
    pub error: Option<String>,
    pub failed_node: Option<String>,
    /// Node visits consumed.
    pub steps: usize,
    /// Wall time of the last engine entry (start or resume), in milliseconds.
    pub elapsed_ms: u64,
}

/// What a call into the engine produced.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Finished(WorkflowResult),
    /// The run is waiting on a human answer.
    Paused {
        request: InteractionRequest,
        checkpoint: RunCheckpoint,
    },
}

impl RunOutcome {
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused { .. })
    }
}

enum Transition {
    /// Follow the first outgoing edge whose guard holds.
    Default,
    To(String),
}

enum NodeStep {
    Next(Transition),
    Suspend(InteractionRequest),
}

/// In-flight position of a run.
struct Cursor {
    node_id: String,
    state: ExecutionState,
    decisions: Vec<Decision>,
    steps: usize,
    attempts: HashMap<String, u32>,
}

/// Walks workflow templates node by node.
///
/// A run either finishes (successfully or not) or pauses at an interactive
/// node. Pausing registers the request with the [`InteractionRegistry`] and
/// hands back a [`RunCheckpoint`]; [`resume`](Self::resume) re-enters at the
/// checkpointed node with the human's answer.
pub struct WorkflowExecutor {
    llm: Arc<dyn LlmClient>,
    catalog: Arc<dyn QuestionCatalog>,
    commands: Arc<dyn CommandRunner>,
    conditions: Arc<dyn ConditionEvaluator>,
    interactions: Arc<InteractionRegistry>,
    event_bus: Arc<EventBus>,
    max_node_visits: usize,
    default_max_retries: u32,
    default_tools: Vec<String>,
}

impl WorkflowExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        catalog: Arc<dyn QuestionCatalog>,
        commands: Arc<dyn CommandRunner>,
        conditions: Arc<dyn ConditionEvaluator>,
        interactions: Arc<InteractionRegistry>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            llm,
            catalog,
            commands,
            conditions,
            interactions,
            event_bus,
            max_node_visits: 100,
            default_max_retries: 3,
            default_tools: vec![],
        }
    }

    /// Node visits allowed per run.
    pub fn with_max_node_visits(mut self, visits: usize) -> Self {
        self.max_node_visits = visits.max(1);
        self
    }

    /// Retry budget for catalog questions that don't set one.
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries.max(1);
        self
    }

    /// Tools offered to LLM nodes that don't list their own.
    pub fn with_default_tools(mut self, tools: Vec<String>) -> Self {
        self.default_tools = tools;
        self
    }

    pub fn interactions(&self) -> &Arc<InteractionRegistry> {
        &self.interactions
    }

    /// Run a template from its start node with empty variables.
    ///
    /// Template problems are returned as `Err` before any node runs; every
    /// failure after that is reported in a failed [`WorkflowResult`].
    pub async fn start(
        &self,
        template: &WorkflowTemplate,
        scope: &RunScope,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        template.validate()?;

        info!(
            run_id = %scope.run_id,
            template = %template.name,
            phase = %scope.phase,
            "Starting workflow run"
        );

        let cursor = Cursor {
            node_id: template.graph.start.clone(),
            state: ExecutionState::new(),
            decisions: vec![],
            steps: 0,
            attempts: HashMap::new(),
        };
        Ok(self.drive(template, scope, cursor, None, cancel).await)
    }

    /// Re-enter a paused run at its checkpointed node with an answer.
    pub async fn resume(
        &self,
        template: &WorkflowTemplate,
        scope: &RunScope,
        checkpoint: RunCheckpoint,
        response: InteractionResponse,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        template.validate()?;

        if checkpoint.template != template.name {
            return Err(PhaseflowError::InvalidInteraction(format!(
                "checkpoint belongs to template '{}', not '{}'",
                checkpoint.template, template.name
            )));
        }
        if checkpoint.awaiting_request != response.request_id {
            return Err(PhaseflowError::InvalidInteraction(format!(
                "response answers request {}, but the run is waiting on {}",
                response.request_id, checkpoint.awaiting_request
            )));
        }

        info!(
            run_id = %scope.run_id,
            template = %template.name,
            node_id = %checkpoint.node_id,
            "Resuming workflow run"
        );

        let cursor = Cursor {
            node_id: checkpoint.node_id,
            state: ExecutionState::from_map(checkpoint.variables),
            decisions: checkpoint.decisions,
            steps: checkpoint.steps,
            attempts: checkpoint.attempts,
        };
        Ok(self
            .drive(template, scope, cursor, Some(response), cancel)
            .await)
    }

    async fn drive(
        &self,
        template: &WorkflowTemplate,
        scope: &RunScope,
        mut cursor: Cursor,
        mut answer: Option<InteractionResponse>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                warn!(run_id = %scope.run_id, node_id = %cursor.node_id, "Run cancelled");
                return self.fail(template, scope, cursor, PhaseflowError::Cancelled, started);
            }

            let node_id = cursor.node_id.clone();
            let resuming = answer.is_some();

            // Re-entering the suspended node is not a new visit.
            if !resuming {
                if cursor.steps >= self.max_node_visits {
                    let err = PhaseflowError::InfiniteLoop {
                        node_id,
                        visits: cursor.steps,
                    };
                    return self.fail(template, scope, cursor, err, started);
                }
                cursor.steps += 1;
            }

            let node = match template.node(&node_id) {
                Some(node) => node,
                None => {
                    let err = PhaseflowError::NodeNotFound(node_id);
                    return self.fail(template, scope, cursor, err, started);
                }
            };

            if !resuming {
                debug!(run_id = %scope.run_id, node_id = %node.id, node_type = node.type_name(), "Executing node");
                self.event_bus.publish(EngineEvent::NodeStarted {
                    run_id: scope.run_id.clone(),
                    node_id: node.id.clone(),
                });
            }

            // A slow collaborator call is dropped as soon as the run is
            // cancelled, along with anything it registered.
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.interactions.release(&scope.run_id).await;
                    Err(PhaseflowError::Cancelled)
                }
                step = self.execute_node(node, &mut cursor, scope, answer.take()) => step,
            };

            let transition = match step {
                Ok(NodeStep::Next(transition)) => transition,
                Ok(NodeStep::Suspend(request)) => {
                    let suspended = self.suspend(template, scope, &cursor, request).await;
                    return match suspended {
                        Ok(outcome) => outcome,
                        Err(e) => self.fail(template, scope, cursor, e, started),
                    };
                }
                Err(e) => {
                    self.publish_node_completed(scope, &node.id, false);
                    let err = attribute(e, &node.id);
                    return self.fail(template, scope, cursor, err, started);
                }
            };

            self.publish_node_completed(scope, &node.id, true);

            if node.id == template.graph.end {
                return self.finish(template, scope, cursor, started);
            }

            let next = match transition {
                Transition::To(target) => target,
                Transition::Default => {
                    match self.default_edge(template, &node.id, &cursor.state).await {
                        Ok(target) => target,
                        Err(e) => return self.fail(template, scope, cursor, e, started),
                    }
                }
            };
            debug!(run_id = %scope.run_id, from = %node.id, to = %next, "Following edge");
            cursor.node_id = next;
        }
    }

    async fn execute_node(
        &self,
        node: &WorkflowNode,
        cursor: &mut Cursor,
        scope: &RunScope,
        answer: Option<InteractionResponse>,
    ) -> Result<NodeStep> {
        let fixed = scope.fields();

        match &node.kind {
            NodeKind::Start | NodeKind::End => Ok(NodeStep::Next(Transition::Default)),

            NodeKind::Llm {
                prompt,
                output_key,
                tools,
            } => {
                let prompt = cursor.state.render(prompt, &fixed);
                let tools = if tools.is_empty() {
                    &self.default_tools
                } else {
                    tools
                };
                let response = self
                    .llm
                    .complete(&prompt, tools)
                    .await
                    .map_err(|e| node_failed(&node.id, e))?;

                cursor.state.set_str(output_key.clone(), response.clone());
                cursor
                    .decisions
                    .push(Decision::new(&node.id, node.label(), response));
                Ok(NodeStep::Next(Transition::Default))
            }

            NodeKind::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                let result = self
                    .conditions
                    .evaluate(condition, cursor.state.data())
                    .await?;
                debug!(node_id = %node.id, condition = %condition, result, "Condition evaluated");
                let target = resolve_branch(result, if_true.as_deref(), if_false.as_deref())
                    .ok_or_else(|| PhaseflowError::NodeFailed {
                        node_id: node.id.clone(),
                        message: format!("no branch target for result {}", result),
                    })?;
                Ok(NodeStep::Next(Transition::To(target.to_string())))
            }

            NodeKind::HumanInteraction {
                prompt,
                output_key,
                input_keys,
            } => match answer {
                Some(response) => {
                    cursor.state.set_str(output_key.clone(), response.answer.clone());
                    cursor
                        .decisions
                        .push(Decision::new(&node.id, node.label(), response.answer));
                    Ok(NodeStep::Next(Transition::Default))
                }
                None => {
                    let mut context = request_context(node, scope);
                    for key in input_keys {
                        if let Some(value) = cursor.state.get(key) {
                            context.insert(key.clone(), value.clone());
                        }
                    }
                    let question = cursor.state.render(prompt, &fixed);
                    Ok(NodeStep::Suspend(InteractionRequest::ask_user(
                        question, context,
                    )?))
                }
            },

            NodeKind::Aggregation {
                input_keys,
                output_key,
            } => {
                let values = cursor.state.collect(input_keys);
                cursor
                    .state
                    .set(output_key.clone(), serde_json::Value::Array(values));
                Ok(NodeStep::Next(Transition::Default))
            }

            NodeKind::SystemCommand {
                command,
                expected_output,
                output_key,
                on_failure,
            } => {
                let command = cursor.state.render(command, &fixed);
                let (passed, output) = match self.commands.run(&command).await {
                    Ok(out) => {
                        let expected = expected_output
                            .as_deref()
                            .map_or(true, |e| out.output.contains(e));
                        (out.success && expected, out.output)
                    }
                    Err(e) => (false, e.to_string()),
                };

                if let Some(key) = output_key {
                    cursor.state.set_str(key.clone(), output.clone());
                }
                cursor.state.set_str(
                    format!("{}_status", node.id),
                    if passed { "success" } else { "failure" },
                );

                if passed {
                    Ok(NodeStep::Next(Transition::Default))
                } else {
                    warn!(node_id = %node.id, command = %command, "System command did not pass");
                    Ok(NodeStep::Next(match on_failure {
                        Some(target) => Transition::To(target.clone()),
                        None => Transition::Default,
                    }))
                }
            }

            NodeKind::GetQuestion {
                question_id,
                output_key,
            } => {
                let question = self.fetch_question(&node.id, question_id).await?;
                cursor.state.set_str(output_key.clone(), question.text);
                Ok(NodeStep::Next(Transition::Default))
            }

            NodeKind::AskCatalogQuestion {
                question_id,
                output_key,
                validation_rules,
                max_retries,
                on_failure,
            } => {
                let question = self.fetch_question(&node.id, question_id).await?;
                let budget = max_retries.unwrap_or(self.default_max_retries);

                let Some(response) = answer else {
                    let request = catalog_request(node, scope, &question, budget, 0, None)?;
                    return Ok(NodeStep::Suspend(request));
                };

                let rules = if validation_rules.is_empty() {
                    &question.validation_rules
                } else {
                    validation_rules
                };

                match validate_answer(&response.answer, rules) {
                    Ok(()) => {
                        cursor.attempts.remove(&node.id);
                        cursor.state.set_str(output_key.clone(), response.answer.clone());
                        cursor
                            .decisions
                            .push(Decision::new(&node.id, node.label(), response.answer));
                        Ok(NodeStep::Next(Transition::Default))
                    }
                    Err(reason) => {
                        let attempts = {
                            let count = cursor.attempts.entry(node.id.clone()).or_insert(0);
                            *count += 1;
                            *count
                        };
                        warn!(
                            node_id = %node.id,
                            question_id = %question_id,
                            attempts,
                            budget,
                            reason = %reason,
                            "Catalog answer rejected"
                        );

                        if attempts < budget {
                            let request = catalog_request(
                                node,
                                scope,
                                &question,
                                budget,
                                attempts,
                                Some(&reason),
                            )?;
                            return Ok(NodeStep::Suspend(request));
                        }

                        cursor.attempts.remove(&node.id);
                        match on_failure {
                            Some(target) => {
                                cursor.state.set_str(
                                    format!("{}_status", node.id),
                                    "failure",
                                );
                                Ok(NodeStep::Next(Transition::To(target.clone())))
                            }
                            None => Err(PhaseflowError::AnswerRejected {
                                question_id: question_id.clone(),
                                attempts,
                                reason,
                            }),
                        }
                    }
                }
            }

            NodeKind::ValidateAnswer {
                input_key,
                validation_rules,
                on_failure,
            } => {
                let value = cursor.state.get_text(input_key).unwrap_or_default();
                match validate_answer(&value, validation_rules) {
                    Ok(()) => Ok(NodeStep::Next(Transition::Default)),
                    Err(reason) => {
                        warn!(node_id = %node.id, input_key = %input_key, reason = %reason, "Validation failed");
                        match on_failure {
                            Some(target) => Ok(NodeStep::Next(Transition::To(target.clone()))),
                            None => Err(PhaseflowError::NodeFailed {
                                node_id: node.id.clone(),
                                message: reason,
                            }),
                        }
                    }
                }
            }

            NodeKind::Approval {
                prompt,
                output_key,
                on_reject,
            } => {
                let question = cursor.state.render(prompt, &fixed);
                let Some(response) = answer else {
                    let request =
                        InteractionRequest::approval(question, request_context(node, scope))?;
                    return Ok(NodeStep::Suspend(request));
                };

                match interpret_approval(&response.answer) {
                    Some(true) => {
                        cursor.attempts.remove(&node.id);
                        cursor.state.set_str(output_key.clone(), "approved");
                        cursor
                            .decisions
                            .push(Decision::new(&node.id, node.label(), "approved"));
                        Ok(NodeStep::Next(Transition::Default))
                    }
                    approved => {
                        // Unrecognised answers are re-asked until the retry budget runs out.
                        if approved.is_none() {
                            let attempts = {
                                let count = cursor.attempts.entry(node.id.clone()).or_insert(0);
                                *count += 1;
                                *count
                            };
                            if attempts < self.default_max_retries {
                                let mut context = request_context(node, scope);
                                context.insert(
                                    "rejection_reason".into(),
                                    serde_json::json!("answer yes or no"),
                                );
                                return Ok(NodeStep::Suspend(InteractionRequest::approval(
                                    question, context,
                                )?));
                            }
                        }

                        cursor.attempts.remove(&node.id);
                        cursor.state.set_str(output_key.clone(), "rejected");
                        cursor.decisions.push(Decision::new(
                            &node.id,
                            node.label(),
                            format!("rejected: {}", response.answer),
                        ));
                        match on_reject {
                            Some(target) => Ok(NodeStep::Next(Transition::To(target.clone()))),
                            None => Err(PhaseflowError::NodeFailed {
                                node_id: node.id.clone(),
                                message: "approval rejected".into(),
                            }),
                        }
                    }
                }
            }
        }
    }

    async fn fetch_question(&self, node_id: &str, question_id: &str) -> Result<CatalogQuestion> {
        self.catalog
            .get_question(question_id)
            .await
            .map_err(|e| node_failed(node_id, e))
    }

    /// First outgoing edge whose guard is absent or holds.
    async fn default_edge(
        &self,
        template: &WorkflowTemplate,
        node_id: &str,
        state: &ExecutionState,
    ) -> Result<String> {
        for edge in template.outgoing(node_id) {
            let take = match &edge.guard {
                None => true,
                Some(guard) => self.conditions.evaluate(guard, state.data()).await?,
            };
            if take {
                return Ok(edge.to.clone());
            }
        }
        Err(PhaseflowError::NoOutgoingEdge {
            node_id: node_id.to_string(),
        })
    }

    async fn suspend(
        &self,
        template: &WorkflowTemplate,
        scope: &RunScope,
        cursor: &Cursor,
        request: InteractionRequest,
    ) -> Result<RunOutcome> {
        self.interactions
            .register(&scope.run_id, request.clone())
            .await?;

        info!(
            run_id = %scope.run_id,
            node_id = %cursor.node_id,
            request_id = %request.id,
            "Run paused for input"
        );

        let checkpoint = RunCheckpoint {
            run_id: scope.run_id.clone(),
            template: template.name.clone(),
            node_id: cursor.node_id.clone(),
            variables: cursor.state.data().clone(),
            decisions: cursor.decisions.clone(),
            steps: cursor.steps,
            attempts: cursor.attempts.clone(),
            awaiting_request: request.id.clone(),
            saved_at: Utc::now(),
        };
        Ok(RunOutcome::Paused {
            request,
            checkpoint,
        })
    }

    fn finish(
        &self,
        template: &WorkflowTemplate,
        scope: &RunScope,
        cursor: Cursor,
        started: Instant,
    ) -> RunOutcome {
        let summary = summarize(&template.name, cursor.steps, &cursor.decisions);
        info!(run_id = %scope.run_id, steps = cursor.steps, "Workflow run completed");
        self.event_bus.publish(EngineEvent::RunCompleted {
            run_id: scope.run_id.clone(),
            steps: cursor.steps,
        });

        RunOutcome::Finished(WorkflowResult {
            run_id: scope.run_id.clone(),
            success: true,
            summary,
            decisions: cursor.decisions,
            variables: cursor.state,
            error: None,
            failed_node: None,
            steps: cursor.steps,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn fail(
        &self,
        template: &WorkflowTemplate,
        scope: &RunScope,
        cursor: Cursor,
        err: PhaseflowError,
        started: Instant,
    ) -> RunOutcome {
        let failed_node = err
            .node_id()
            .map(str::to_string)
            .unwrap_or_else(|| cursor.node_id.clone());
        let message = err.to_string();
        error!(run_id = %scope.run_id, node_id = %failed_node, error = %message, "Workflow run failed");
        self.event_bus.publish(EngineEvent::RunFailed {
            run_id: scope.run_id.clone(),
            node_id: Some(failed_node.clone()),
            error: message.clone(),
        });

        let mut summary = format!(
            "Workflow '{}' failed at node '{}' after {} steps: {}",
            template.name, failed_node, cursor.steps, message
        );
        append_decisions(&mut summary, &cursor.decisions);

        RunOutcome::Finished(WorkflowResult {
            run_id: scope.run_id.clone(),
            success: false,
            summary,
            decisions: cursor.decisions,
            variables: cursor.state,
            error: Some(message),
            failed_node: Some(failed_node),
            steps: cursor.steps,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn publish_node_completed(&self, scope: &RunScope, node_id: &str, succeeded: bool) {
        self.event_bus.publish(EngineEvent::NodeCompleted {
            run_id: scope.run_id.clone(),
            node_id: node_id.to_string(),
            succeeded,
        });
    }
}

/// Target of a conditional node for a given condition result.
pub fn resolve_branch<'a>(
    result: bool,
    if_true: Option<&'a str>,
    if_false: Option<&'a str>,
) -> Option<&'a str> {
    if result {
        if_true
    } else {
        if_false
    }
}

/// "Workflow '<name>' completed in N steps" plus one line per decision.
pub fn summarize(template: &str, steps: usize, decisions: &[Decision]) -> String {
    let mut summary = format!("Workflow '{}' completed in {} steps", template, steps);
    append_decisions(&mut summary, decisions);
    summary
}

fn append_decisions(summary: &mut String, decisions: &[Decision]) {
    for decision in decisions {
        summary.push_str(&format!(
            "\n- {}: {}",
            decision.node_id,
            truncate(decision.output.trim(), SUMMARY_OUTPUT_CHARS)
        ));
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

fn node_failed(node_id: &str, err: PhaseflowError) -> PhaseflowError {
    PhaseflowError::NodeFailed {
        node_id: node_id.to_string(),
        message: err.to_string(),
    }
}

/// Pin errors without a node of their own to the node that raised them.
fn attribute(err: PhaseflowError, node_id: &str) -> PhaseflowError {
    if err.node_id().is_some() {
        return err;
    }
    match err {
        PhaseflowError::AnswerRejected { .. } | PhaseflowError::Cancelled => err,
        other => node_failed(node_id, other),
    }
}

fn request_context(
    node: &WorkflowNode,
    scope: &RunScope,
) -> HashMap<String, serde_json::Value> {
    HashMap::from([
        ("node_id".to_string(), serde_json::json!(node.id)),
        ("phase".to_string(), serde_json::json!(scope.phase)),
    ])
}

fn catalog_request(
    node: &WorkflowNode,
    scope: &RunScope,
    question: &CatalogQuestion,
    budget: u32,
    rejected: u32,
    rejection_reason: Option<&str>,
) -> Result<InteractionRequest> {
    let mut context = request_context(node, scope);
    context.insert("attempt".into(), serde_json::json!(rejected + 1));
    context.insert("max_attempts".into(), serde_json::json!(budget));
    if !question.category.is_empty() {
        context.insert("category".into(), serde_json::json!(question.category));
    }
    if let Some(reason) = rejection_reason {
        context.insert("rejection_reason".into(), serde_json::json!(reason));
    }
    InteractionRequest::catalog_question(&question.id, &question.text, context)
}
