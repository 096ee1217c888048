use futures::future::BoxFuture;

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::interaction::{InteractionRequest, InteractionType};
use phaseflow_core::traits::VibeCheckEvaluator;
use phaseflow_core::vibe::{VibeCheck, VibeCheckContext, VibeCheckResult};

/// Asks the operator to judge each vibe check on the terminal.
pub struct ConsoleVibeEvaluator;

impl VibeCheckEvaluator for ConsoleVibeEvaluator {
    fn evaluate<'a>(
        &'a self,
        check: &'a VibeCheck,
        _context: &'a VibeCheckContext,
    ) -> BoxFuture<'a, Result<VibeCheckResult>> {
        Box::pin(async move {
            let owned = check.clone();
            let (passed, findings) = tokio::task::spawn_blocking(move || {
                let kind = if owned.required { "required" } else { "optional" };
                eprintln!("\n[VIBE CHECK] ({}, {}) {}", owned.category, kind, owned.question);
                let passed = dialoguer::Confirm::new()
                    .with_prompt("Does the phase pass this check?")
                    .default(true)
                    .interact()
                    .map_err(|e| PhaseflowError::Evaluator(e.to_string()))?;
                let findings: String = dialoguer::Input::new()
                    .with_prompt("Findings")
                    .allow_empty(true)
                    .interact_text()
                    .map_err(|e| PhaseflowError::Evaluator(e.to_string()))?;
                Ok::<_, PhaseflowError>((passed, findings))
            })
            .await
            .map_err(|e| PhaseflowError::Evaluator(e.to_string()))??;

            Ok(VibeCheckResult::new(check.clone(), passed, findings))
        })
    }

    fn evaluate_batch<'a>(
        &'a self,
        checks: &'a [VibeCheck],
        context: &'a VibeCheckContext,
    ) -> BoxFuture<'a, Result<Vec<VibeCheckResult>>> {
        Box::pin(async move {
            eprintln!("\n{}", context.render());
            let mut results = Vec::with_capacity(checks.len());
            for check in checks {
                results.push(self.evaluate(check, context).await?);
            }
            Ok(results)
        })
    }
}

/// Prompt the operator for the answer to a pending interaction.
pub async fn ask(request: &InteractionRequest) -> anyhow::Result<String> {
    let request = request.clone();
    let answer = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        if let Some(reason) = request.context.get("rejection_reason").and_then(|v| v.as_str()) {
            eprintln!("[REJECTED] {}", reason);
        }
        match request.interaction_type {
            InteractionType::Approval => {
                eprintln!("\n[APPROVAL] {}", request.question);
                let approved = dialoguer::Confirm::new()
                    .with_prompt("Approve?")
                    .default(true)
                    .interact()?;
                Ok(if approved { "yes" } else { "no" }.to_string())
            }
            InteractionType::AskUser | InteractionType::AskCatalogQuestion => {
                let label = request.question_id.as_deref().unwrap_or("QUESTION");
                eprintln!("\n[{}] {}", label, request.question);
                let answer: String = dialoguer::Input::new()
                    .with_prompt("Answer")
                    .interact_text()?;
                Ok(answer)
            }
        }
    })
    .await??;
    Ok(answer)
}
