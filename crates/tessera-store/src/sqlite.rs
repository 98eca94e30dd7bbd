use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Store;
use tessera_core::types::{ApprovalRequest, Execution, ExecutionId, StepExecution};
use tessera_core::workflow::WorkflowDefinition;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        doc TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        doc TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_workflow
        ON executions(workflow_id);

    CREATE TABLE IF NOT EXISTS step_executions (
        id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        status TEXT NOT NULL,
        doc TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_steps_execution
        ON step_executions(execution_id);

    CREATE TABLE IF NOT EXISTS approvals (
        id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        status TEXT NOT NULL,
        doc TEXT NOT NULL
    );";

fn db_err(e: impl std::fmt::Display) -> TesseraError {
    TesseraError::Store(e.to_string())
}

/// SQLite-backed store. Records are kept as JSON documents next to a few
/// indexed columns.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// All step records of one execution, oldest first.
    pub fn step_records(&self, execution_id: &ExecutionId) -> Result<Vec<StepExecution>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare("SELECT doc FROM step_executions WHERE execution_id = ?1 ORDER BY rowid ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![execution_id.as_str()], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut records = Vec::new();
        for row in rows {
            let doc = row.map_err(db_err)?;
            records.push(serde_json::from_str(&doc).map_err(db_err)?);
        }
        Ok(records)
    }

    fn load_doc<T: serde::de::DeserializeOwned>(&self, sql: &str, id: &str) -> Result<Option<T>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let doc: Option<String> = conn
            .query_row(sql, params![id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        doc.map(|d| serde_json::from_str(&d).map_err(db_err))
            .transpose()
    }
}

fn status_text<T: serde::Serialize>(status: &T) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

impl Store for SqliteStore {
    fn save_workflow(&self, def: &WorkflowDefinition) -> BoxFuture<'_, Result<()>> {
        let row = serde_json::to_string(def).map(|doc| (def.id.clone(), def.name.clone(), doc));
        Box::pin(async move {
            let (id, name, doc) = row.map_err(db_err)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT OR REPLACE INTO workflows (id, name, doc, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, name, doc, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn save_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let row = serde_json::to_string(execution).map(|doc| {
            (
                execution.id.to_string(),
                execution.workflow_id.clone(),
                execution.status.to_string(),
                doc,
            )
        });
        Box::pin(async move {
            let (id, workflow_id, status, doc) = row.map_err(db_err)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT OR REPLACE INTO executions (id, workflow_id, status, doc, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, workflow_id, status, doc, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn save_step_execution(
        &self,
        execution_id: &ExecutionId,
        step: &StepExecution,
    ) -> BoxFuture<'_, Result<()>> {
        let row = serde_json::to_string(step).map(|doc| {
            (
                step.id.clone(),
                execution_id.to_string(),
                step.step_id.clone(),
                status_text(&step.status),
                doc,
            )
        });
        Box::pin(async move {
            let (id, execution_id, step_id, status, doc) = row.map_err(db_err)?;
            let conn = self.conn.lock().map_err(db_err)?;
            // Upsert keeps the original rowid so records stay in start order.
            conn.execute(
                "INSERT INTO step_executions (id, execution_id, step_id, status, doc)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, doc = excluded.doc",
                params![id, execution_id, step_id, status, doc],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn save_approval(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        let row = serde_json::to_string(request).map(|doc| {
            (
                request.id.clone(),
                request.execution_id.to_string(),
                status_text(&request.status),
                doc,
            )
        });
        Box::pin(async move {
            let (id, execution_id, status, doc) = row.map_err(db_err)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT OR REPLACE INTO approvals (id, execution_id, status, doc) VALUES (?1, ?2, ?3, ?4)",
                params![id, execution_id, status, doc],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.to_string();
        Box::pin(async move { self.load_doc("SELECT doc FROM executions WHERE id = ?1", &id) })
    }

    fn load_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let id = id.to_string();
        Box::pin(async move { self.load_doc("SELECT doc FROM workflows WHERE id = ?1", &id) })
    }

    fn load_approval(&self, id: &str) -> BoxFuture<'_, Result<Option<ApprovalRequest>>> {
        let id = id.to_string();
        Box::pin(async move { self.load_doc("SELECT doc FROM approvals WHERE id = ?1", &id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::types::{ExecutionContext, ExecutionStatus, StepStatus};
    use tessera_core::workflow::WorkflowStep;

    #[tokio::test]
    async fn execution_roundtrip_and_update() {
        let store = SqliteStore::in_memory().unwrap();
        let mut exec = Execution::new("wf", ExecutionContext::default());
        exec.context
            .variables
            .insert("region".into(), serde_json::json!("eu"));
        store.save_execution(&exec).await.unwrap();

        exec.status = ExecutionStatus::Failed;
        store.save_execution(&exec).await.unwrap();

        let loaded = store.load_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.context.variables["region"], "eu");
        assert!(store
            .load_execution(&ExecutionId::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn step_records_keep_start_order() {
        let store = SqliteStore::in_memory().unwrap();
        let id = ExecutionId::new();
        let mut first = StepExecution::new("a");
        let second = StepExecution::new("b");
        store.save_step_execution(&id, &first).await.unwrap();
        store.save_step_execution(&id, &second).await.unwrap();
        first.transition(StepStatus::Running).unwrap();
        store.save_step_execution(&id, &first).await.unwrap();

        let records = store.step_records(&id).unwrap();
        let steps: Vec<&str> = records.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(steps, vec!["a", "b"]);
        assert_eq!(records[0].status, StepStatus::Running);
    }

    #[tokio::test]
    async fn approval_upsert_and_load() {
        use tessera_core::types::ApprovalStatus;

        let store = SqliteStore::in_memory().unwrap();
        let mut request = ApprovalRequest {
            id: "ap-1".into(),
            execution_id: ExecutionId::new(),
            rule_id: "gate".into(),
            step_id: "deploy".into(),
            approvers: vec!["lead".into()],
            required_approvals: 1,
            votes: vec![],
            status: ApprovalStatus::Pending,
            deadline: Utc::now(),
            escalation_level: 0,
            created_at: Utc::now(),
            resolved_at: None,
        };
        store.save_approval(&request).await.unwrap();
        request.resolve(ApprovalStatus::Timeout);
        store.save_approval(&request).await.unwrap();

        let loaded = store.load_approval("ap-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ApprovalStatus::Timeout);
        assert_eq!(loaded.step_id, "deploy");
        assert!(store.load_approval("ap-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tessera.db");
        let def = WorkflowDefinition::new("deploy")
            .with_id("wf-deploy")
            .with_step(WorkflowStep::new("build", "echo"));
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_workflow(&def).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load_workflow("wf-deploy").await.unwrap().unwrap();
        assert_eq!(loaded.name, "deploy");
        assert_eq!(loaded.steps[0].id, "build");
    }
}
