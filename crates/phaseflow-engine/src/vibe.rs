use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{info, warn};

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::event::EventBus;
use phaseflow_core::traits::{LlmClient, VibeCheckEvaluator};
use phaseflow_core::types::{EngineEvent, ExecutionId};
use phaseflow_core::vibe::{VibeCheck, VibeCheckContext, VibeCheckResult};

/// Passes every check. For unattended runs and tests.
#[derive(Debug, Clone, Default)]
pub struct AutoPassEvaluator;

impl VibeCheckEvaluator for AutoPassEvaluator {
    fn evaluate<'a>(
        &'a self,
        check: &'a VibeCheck,
        _context: &'a VibeCheckContext,
    ) -> BoxFuture<'a, Result<VibeCheckResult>> {
        Box::pin(async move { Ok(VibeCheckResult::new(check.clone(), true, "auto-pass")) })
    }
}

/// AI-assisted evaluation: asks the language model for a JSON verdict.
///
/// Unparseable replies fail the check with the raw reply as findings, so a
/// confused model can never wave a required check through.
pub struct LlmVibeEvaluator {
    llm: Arc<dyn LlmClient>,
}

impl LlmVibeEvaluator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn prompt(check: &VibeCheck, context: &VibeCheckContext) -> String {
        format!(
            r#"You are reviewing the outcome of an engineering phase.

{}
Quality check ({}, {}): {}

Decide whether the phase output satisfies this check. Respond with ONLY valid JSON:
{{
  "passed": true | false,
  "findings": "brief explanation"
}}"#,
            context.render(),
            check.category,
            if check.required { "required" } else { "optional" },
            check.question,
        )
    }
}

impl VibeCheckEvaluator for LlmVibeEvaluator {
    fn evaluate<'a>(
        &'a self,
        check: &'a VibeCheck,
        context: &'a VibeCheckContext,
    ) -> BoxFuture<'a, Result<VibeCheckResult>> {
        Box::pin(async move {
            let prompt = Self::prompt(check, context);
            let reply = self
                .llm
                .complete(&prompt, &[])
                .await
                .map_err(|e| PhaseflowError::Evaluator(format!("vibe check LLM call failed: {}", e)))?;

            let (passed, findings) = parse_verdict(&reply);
            Ok(VibeCheckResult::new(check.clone(), passed, findings))
        })
    }
}

/// Verdict returned by the model.
#[derive(Deserialize)]
struct VerdictResponse {
    passed: bool,
    #[serde(default)]
    findings: String,
}

fn parse_verdict(reply: &str) -> (bool, String) {
    let json_str = extract_json(reply);
    match serde_json::from_str::<VerdictResponse>(json_str) {
        Ok(resp) => (resp.passed, resp.findings),
        Err(e) => {
            warn!(error = %e, reply = %reply, "Failed to parse vibe check verdict");
            (false, format!("unparseable verdict: {}", reply.trim()))
        }
    }
}

/// Extract JSON from a reply that may contain markdown code fences.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return &trimmed[start..=end];
            }
        }
    }
    trimmed
}

/// Runs a phase's checks through an evaluator and publishes each outcome.
pub struct QualityGate {
    evaluator: Arc<dyn VibeCheckEvaluator>,
    event_bus: Arc<EventBus>,
}

impl QualityGate {
    pub fn new(evaluator: Arc<dyn VibeCheckEvaluator>, event_bus: Arc<EventBus>) -> Self {
        Self {
            evaluator,
            event_bus,
        }
    }

    /// Evaluate `checks` in order. The evaluator must return one result per
    /// check, in input order.
    pub async fn evaluate(
        &self,
        execution_id: &ExecutionId,
        checks: &[VibeCheck],
        context: &VibeCheckContext,
    ) -> Result<Vec<VibeCheckResult>> {
        if checks.is_empty() {
            return Ok(vec![]);
        }

        let results = self.evaluator.evaluate_batch(checks, context).await?;
        if results.len() != checks.len() {
            return Err(PhaseflowError::Evaluator(format!(
                "expected {} vibe check results, got {}",
                checks.len(),
                results.len()
            )));
        }

        for (check, result) in checks.iter().zip(&results) {
            if result.check.question != check.question {
                return Err(PhaseflowError::Evaluator(format!(
                    "vibe check results out of order: expected '{}', got '{}'",
                    check.question, result.check.question
                )));
            }
            info!(
                execution_id = %execution_id,
                question = %check.question,
                required = check.required,
                passed = result.passed,
                "Vibe check evaluated"
            );
            self.event_bus.publish(EngineEvent::VibeCheckEvaluated {
                execution_id: execution_id.clone(),
                question: check.question.clone(),
                required: check.required,
                passed: result.passed,
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaseflow_core::vibe::GateSummary;
    use phaseflow_test_utils::{FixedVibeEvaluator, ScriptedLlm};

    fn context() -> VibeCheckContext {
        VibeCheckContext {
            phase_name: "Implementation".into(),
            project_path: "/repo".into(),
            branch: "feature/x".into(),
            summary: "Workflow 'impl' completed in 4 steps".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_json_fenced() {
        let text = "Here you go:\n```json\n{\"passed\": true}\n```\nThanks";
        assert_eq!(extract_json(text), "{\"passed\": true}");
    }

    #[test]
    fn test_extract_json_bare() {
        let text = "Verdict: {\"passed\": false, \"findings\": \"no tests\"} done";
        assert_eq!(
            extract_json(text),
            "{\"passed\": false, \"findings\": \"no tests\"}"
        );
    }

    #[test]
    fn test_parse_verdict() {
        let (passed, findings) = parse_verdict(r#"{"passed": true, "findings": "covered"}"#);
        assert!(passed);
        assert_eq!(findings, "covered");
    }

    #[test]
    fn test_unparseable_verdict_fails_check() {
        let (passed, findings) = parse_verdict("Looks great to me!");
        assert!(!passed);
        assert!(findings.contains("Looks great to me!"));
    }

    #[tokio::test]
    async fn test_auto_pass() {
        let evaluator = AutoPassEvaluator;
        let checks = vec![VibeCheck::required("A?"), VibeCheck::optional("B?")];
        let results = evaluator.evaluate_batch(&checks, &context()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.passed));
        assert_eq!(results[1].check.question, "B?");
    }

    #[tokio::test]
    async fn test_llm_evaluator() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            "```json\n{\"passed\": false, \"findings\": \"no error handling\"}\n```",
        ]));
        let evaluator = LlmVibeEvaluator::new(llm.clone());
        let result = evaluator
            .evaluate(&VibeCheck::required("Errors handled?"), &context())
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.findings, "no error handling");
        assert!(llm.prompts()[0].contains("Errors handled?"));
        assert!(llm.prompts()[0].contains("Phase: Implementation"));
    }

    #[tokio::test]
    async fn test_llm_evaluator_propagates_llm_failure() {
        let evaluator = LlmVibeEvaluator::new(Arc::new(ScriptedLlm::failing("down")));
        let err = evaluator
            .evaluate(&VibeCheck::required("Q?"), &context())
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseflowError::Evaluator(_)));
    }

    #[tokio::test]
    async fn test_gate_publishes_in_order() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let evaluator = FixedVibeEvaluator::passing().with_verdict("Docs updated?", false, "stale");
        let gate = QualityGate::new(Arc::new(evaluator), bus);

        let checks = vec![
            VibeCheck::required("Tests pass?"),
            VibeCheck::optional("Docs updated?"),
        ];
        let results = gate
            .evaluate(&ExecutionId::new(), &checks, &context())
            .await
            .unwrap();
        assert!(GateSummary::from_results(&results).passed);

        for expected in ["Tests pass?", "Docs updated?"] {
            match rx.recv().await.unwrap() {
                EngineEvent::VibeCheckEvaluated { question, .. } => assert_eq!(question, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_gate_with_no_checks() {
        let gate = QualityGate::new(Arc::new(AutoPassEvaluator), Arc::new(EventBus::default()));
        let results = gate
            .evaluate(&ExecutionId::new(), &[], &context())
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
