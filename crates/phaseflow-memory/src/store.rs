use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use phaseflow_core::context::ExecutionContext;
use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::traits::MemoryStore;
use phaseflow_core::types::ExecutionId;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS execution_contexts (
        execution_id TEXT PRIMARY KEY,
        project_path TEXT NOT NULL,
        branch TEXT NOT NULL,
        status TEXT NOT NULL,
        context_json TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_contexts_project
        ON execution_contexts(project_path, branch, updated_at);";

/// SQLite-backed store of execution contexts, one row per execution.
///
/// The whole context is kept as JSON; project, branch, status and the update
/// time are duplicated into columns for lookup.
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
}

impl SqliteMemoryStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PhaseflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| PhaseflowError::Database(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| PhaseflowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| PhaseflowError::Database(e.to_string()))?;

        debug!(path = %path.display(), "Memory store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| PhaseflowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| PhaseflowError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored executions.
    pub fn count(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| PhaseflowError::Database(e.to_string()))?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM execution_contexts", [], |row| row.get(0))
            .map_err(|e| PhaseflowError::Database(e.to_string()))?;
        Ok(count as usize)
    }
}

fn decode(json: &str) -> Result<ExecutionContext> {
    serde_json::from_str(json)
        .map_err(|e| PhaseflowError::Database(format!("corrupt execution context: {}", e)))
}

impl MemoryStore for SqliteMemoryStore {
    fn save<'a>(&'a self, context: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(context)?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| PhaseflowError::Database(e.to_string()))?;

            // REPLACE gives the row a fresh rowid, which orders saves made
            // within the same microsecond.
            conn.execute(
                "INSERT OR REPLACE INTO execution_contexts
                    (execution_id, project_path, branch, status, context_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    context.execution.id.as_str(),
                    context.project_path,
                    context.branch,
                    context.execution.status.to_string(),
                    json,
                    context.updated_at.timestamp_micros(),
                ],
            )
            .map_err(|e| PhaseflowError::Database(e.to_string()))?;

            debug!(
                execution_id = %context.execution.id,
                status = %context.execution.status,
                "Execution context saved"
            );
            Ok(())
        })
    }

    fn load<'a>(
        &'a self,
        project_path: &'a str,
        branch: &'a str,
    ) -> BoxFuture<'a, Result<Option<ExecutionContext>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| PhaseflowError::Database(e.to_string()))?;

            let json: Option<String> = conn
                .query_row(
                    "SELECT context_json FROM execution_contexts
                     WHERE project_path = ?1 AND branch = ?2
                     ORDER BY updated_at DESC, rowid DESC
                     LIMIT 1",
                    params![project_path, branch],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| PhaseflowError::Database(e.to_string()))?;

            json.as_deref().map(decode).transpose()
        })
    }

    fn find_by_execution_id<'a>(
        &'a self,
        id: &'a ExecutionId,
    ) -> BoxFuture<'a, Result<Option<ExecutionContext>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| PhaseflowError::Database(e.to_string()))?;

            let json: Option<String> = conn
                .query_row(
                    "SELECT context_json FROM execution_contexts WHERE execution_id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| PhaseflowError::Database(e.to_string()))?;

            json.as_deref().map(decode).transpose()
        })
    }

    fn delete<'a>(&'a self, id: &'a ExecutionId) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| PhaseflowError::Database(e.to_string()))?;

            let removed = conn
                .execute(
                    "DELETE FROM execution_contexts WHERE execution_id = ?1",
                    params![id.as_str()],
                )
                .map_err(|e| PhaseflowError::Database(e.to_string()))?;
            Ok(removed > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaseflow_core::process::{EngineeringProcess, ProcessExecution, ProcessPhase, ProcessStatus};

    fn context(project: &str, branch: &str) -> ExecutionContext {
        let process = EngineeringProcess {
            id: "feature".into(),
            name: "Feature Development".into(),
            description: String::new(),
            phases: vec![ProcessPhase {
                name: "Design".into(),
                description: String::new(),
                workflow: "design".into(),
                vibe_checks: vec![],
                order: 0,
            }],
        };
        ExecutionContext::new(ProcessExecution::create(&process), project, branch)
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let ctx = context("/repo", "main");
        store.save(&ctx).await.unwrap();

        let found = store
            .find_by_execution_id(&ctx.execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.execution.id, ctx.execution.id);
        assert_eq!(found.branch, "main");
        assert!(store
            .find_by_execution_id(&ExecutionId::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_save_replaces() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let ctx = context("/repo", "main");
        store.save(&ctx).await.unwrap();

        let started = ctx.execution.start().unwrap();
        let ctx = ctx.with_execution(started);
        store.save(&ctx).await.unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let found = store
            .find_by_execution_id(&ctx.execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.execution.status, ProcessStatus::InProgress);
    }

    #[tokio::test]
    async fn test_load_returns_latest_for_project() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let older = context("/repo", "main");
        let newer = context("/repo", "main");
        let other = context("/repo", "feature/x");
        store.save(&older).await.unwrap();
        store.save(&newer).await.unwrap();
        store.save(&other).await.unwrap();

        let loaded = store.load("/repo", "main").await.unwrap().unwrap();
        assert_eq!(loaded.execution.id, newer.execution.id);
        assert!(store.load("/elsewhere", "main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let ctx = context("/repo", "main");
        store.save(&ctx).await.unwrap();
        assert!(store.delete(&ctx.execution.id).await.unwrap());
        assert!(!store.delete(&ctx.execution.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.db");
        let ctx = context("/repo", "main");
        {
            let store = SqliteMemoryStore::open(&path).unwrap();
            store.save(&ctx).await.unwrap();
        }
        let store = SqliteMemoryStore::open(&path).unwrap();
        let loaded = store.load("/repo", "main").await.unwrap().unwrap();
        assert_eq!(loaded.execution.id, ctx.execution.id);
    }
}
