use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::event::EventBus;
use phaseflow_core::interaction::{InteractionRequest, InteractionResponse};
use phaseflow_core::types::{EngineEvent, RunId};

/// Pending human interactions, at most one per run.
///
/// Paused runs hold no task or channel: the registry only records which
/// request each run is waiting on, so an answer can be matched and validated
/// before the engine re-enters the run from its checkpoint.
pub struct InteractionRegistry {
    pending: Mutex<HashMap<RunId, InteractionRequest>>,
    event_bus: Arc<EventBus>,
}

impl InteractionRegistry {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register the request a run is now waiting on and publish it.
    /// Fails if the run already has a pending request.
    pub async fn register(&self, run_id: &RunId, request: InteractionRequest) -> Result<()> {
        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(run_id) {
                return Err(PhaseflowError::InteractionPending {
                    run_id: run_id.to_string(),
                });
            }
            pending.insert(run_id.clone(), request.clone());
        }

        info!(
            run_id = %run_id,
            request_id = %request.id,
            interaction_type = %request.interaction_type,
            "Interaction requested"
        );
        self.event_bus.publish(EngineEvent::InteractionRequested {
            run_id: run_id.clone(),
            request,
        });
        Ok(())
    }

    /// Re-register a request loaded from persistence without publishing it
    /// again. A no-op if the same request is already pending.
    pub async fn restore(&self, run_id: &RunId, request: InteractionRequest) -> Result<()> {
        let mut pending = self.pending.lock().await;
        match pending.get(run_id) {
            Some(existing) if existing.id == request.id => Ok(()),
            Some(_) => Err(PhaseflowError::InteractionPending {
                run_id: run_id.to_string(),
            }),
            None => {
                debug!(run_id = %run_id, request_id = %request.id, "Interaction restored");
                pending.insert(run_id.clone(), request);
                Ok(())
            }
        }
    }

    /// Answer the run's pending request.
    ///
    /// A blank answer is rejected and the request stays pending. On success
    /// the request is removed and returned with its response.
    pub async fn resolve(
        &self,
        run_id: &RunId,
        answer: &str,
    ) -> Result<(InteractionRequest, InteractionResponse)> {
        let mut pending = self.pending.lock().await;
        let request = pending.get(run_id).ok_or_else(|| {
            PhaseflowError::InvalidInteraction(format!(
                "run {} has no pending interaction",
                run_id
            ))
        })?;

        let response = InteractionResponse::to_request(request, answer)?;
        let request = pending
            .remove(run_id)
            .ok_or_else(|| PhaseflowError::InvalidInteraction(run_id.to_string()))?;
        drop(pending);

        info!(
            run_id = %run_id,
            request_id = %request.id,
            response_time_ms = response.response_time_ms,
            "Interaction resolved"
        );
        self.event_bus.publish(EngineEvent::InteractionResolved {
            run_id: run_id.clone(),
            request_id: request.id.clone(),
        });
        Ok((request, response))
    }

    /// Drop the run's pending request without an answer (abort).
    pub async fn release(&self, run_id: &RunId) -> Option<InteractionRequest> {
        let request = self.pending.lock().await.remove(run_id)?;
        info!(run_id = %run_id, request_id = %request.id, "Interaction released");
        self.event_bus.publish(EngineEvent::InteractionReleased {
            run_id: run_id.clone(),
            request_id: request.id.clone(),
        });
        Some(request)
    }

    pub async fn pending(&self, run_id: &RunId) -> Option<InteractionRequest> {
        self.pending.lock().await.get(run_id).cloned()
    }

    pub async fn is_awaiting(&self, run_id: &RunId) -> bool {
        self.pending.lock().await.contains_key(run_id)
    }

    /// List all pending requests with their runs.
    pub async fn pending_requests(&self) -> Vec<(RunId, InteractionRequest)> {
        self.pending
            .lock()
            .await
            .iter()
            .map(|(run, req)| (run.clone(), req.clone()))
            .collect()
    }

    /// Find the run whose pending request id starts with `prefix`.
    pub async fn find_by_prefix(&self, prefix: &str) -> Option<RunId> {
        let pending = self.pending.lock().await;
        pending
            .iter()
            .find(|(_, req)| req.id.starts_with(prefix))
            .map(|(run, _)| run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (InteractionRegistry, Arc<EventBus>) {
        let event_bus = Arc::new(EventBus::default());
        (InteractionRegistry::new(event_bus.clone()), event_bus)
    }

    fn ask(question: &str) -> InteractionRequest {
        InteractionRequest::ask_user(question, HashMap::new()).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let (registry, bus) = registry();
        let mut rx = bus.subscribe();
        let run = RunId::new();

        registry.register(&run, ask("Feature name?")).await.unwrap();
        assert!(registry.is_awaiting(&run).await);
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::InteractionRequested { .. }
        ));

        let (request, response) = registry.resolve(&run, "dark mode").await.unwrap();
        assert_eq!(request.question, "Feature name?");
        assert_eq!(response.request_id, request.id);
        assert_eq!(response.answer, "dark mode");
        assert!(!registry.is_awaiting(&run).await);
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::InteractionResolved { .. }
        ));
    }

    #[tokio::test]
    async fn test_second_request_rejected() {
        let (registry, _) = registry();
        let run = RunId::new();

        registry.register(&run, ask("first?")).await.unwrap();
        let err = registry.register(&run, ask("second?")).await.unwrap_err();
        assert!(matches!(err, PhaseflowError::InteractionPending { .. }));
        assert_eq!(registry.pending(&run).await.unwrap().question, "first?");
    }

    #[tokio::test]
    async fn test_blank_answer_keeps_request_pending() {
        let (registry, _) = registry();
        let run = RunId::new();

        registry.register(&run, ask("Name?")).await.unwrap();
        let err = registry.resolve(&run, "   ").await.unwrap_err();
        assert!(matches!(err, PhaseflowError::InvalidInteraction(_)));
        assert!(registry.is_awaiting(&run).await);
    }

    #[tokio::test]
    async fn test_resolve_without_pending() {
        let (registry, _) = registry();
        let err = registry.resolve(&RunId::new(), "x").await.unwrap_err();
        assert!(matches!(err, PhaseflowError::InvalidInteraction(_)));
    }

    #[tokio::test]
    async fn test_release_publishes_event() {
        let (registry, bus) = registry();
        let run = RunId::new();
        registry.register(&run, ask("Continue?")).await.unwrap();

        let mut rx = bus.subscribe();
        let released = registry.release(&run).await.unwrap();
        assert_eq!(released.question, "Continue?");
        assert!(registry.release(&run).await.is_none());
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::InteractionReleased { .. }
        ));
    }

    #[tokio::test]
    async fn test_restore_is_idempotent() {
        let (registry, _) = registry();
        let run = RunId::new();
        let request = ask("Persisted?");

        registry.restore(&run, request.clone()).await.unwrap();
        registry.restore(&run, request.clone()).await.unwrap();
        assert!(registry.restore(&run, ask("other?")).await.is_err());
        assert_eq!(registry.pending_requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_prefix() {
        let (registry, _) = registry();
        let run = RunId::new();
        let request = ask("Which?");
        let prefix = request.id[..8].to_string();
        registry.register(&run, request).await.unwrap();

        assert_eq!(registry.find_by_prefix(&prefix).await, Some(run));
        assert!(registry.find_by_prefix("zzzz-not-an-id").await.is_none());
    }
}
