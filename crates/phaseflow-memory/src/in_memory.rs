use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use phaseflow_core::context::ExecutionContext;
use phaseflow_core::error::Result;
use phaseflow_core::traits::MemoryStore;
use phaseflow_core::types::ExecutionId;

/// Process-local store for tests and one-shot runs.
#[derive(Default)]
pub struct InMemoryStore {
    // Save sequence number alongside each context, to order equal timestamps.
    contexts: Mutex<HashMap<ExecutionId, (u64, ExecutionContext)>>,
    seq: Mutex<u64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.contexts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.lock().await.is_empty()
    }
}

impl MemoryStore for InMemoryStore {
    fn save<'a>(&'a self, context: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let seq = {
                let mut seq = self.seq.lock().await;
                *seq += 1;
                *seq
            };
            self.contexts
                .lock()
                .await
                .insert(context.execution.id.clone(), (seq, context.clone()));
            Ok(())
        })
    }

    fn load<'a>(
        &'a self,
        project_path: &'a str,
        branch: &'a str,
    ) -> BoxFuture<'a, Result<Option<ExecutionContext>>> {
        Box::pin(async move {
            Ok(self
                .contexts
                .lock()
                .await
                .values()
                .filter(|(_, ctx)| ctx.project_path == project_path && ctx.branch == branch)
                .max_by_key(|(seq, ctx)| (ctx.updated_at, *seq))
                .map(|(_, ctx)| ctx.clone()))
        })
    }

    fn find_by_execution_id<'a>(
        &'a self,
        id: &'a ExecutionId,
    ) -> BoxFuture<'a, Result<Option<ExecutionContext>>> {
        Box::pin(async move { Ok(self.contexts.lock().await.get(id).map(|(_, ctx)| ctx.clone())) })
    }

    fn delete<'a>(&'a self, id: &'a ExecutionId) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.contexts.lock().await.remove(id).is_some()) })
    }
}
