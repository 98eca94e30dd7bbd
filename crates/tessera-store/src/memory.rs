use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use tessera_core::error::Result;
use tessera_core::traits::Store;
use tessera_core::types::{ApprovalRequest, Execution, ExecutionId, StepExecution};
use tessera_core::workflow::WorkflowDefinition;

/// Process-local store. Everything is lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    workflows: Mutex<HashMap<String, WorkflowDefinition>>,
    executions: Mutex<HashMap<ExecutionId, Execution>>,
    /// Step records keyed by execution, then record id.
    steps: Mutex<HashMap<ExecutionId, HashMap<String, StepExecution>>>,
    approvals: Mutex<HashMap<String, ApprovalRequest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn step_records(&self, execution_id: &ExecutionId) -> Vec<StepExecution> {
        let mut records: Vec<StepExecution> = self
            .steps
            .lock()
            .await
            .get(execution_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        records
    }

    pub async fn execution_count(&self) -> usize {
        self.executions.lock().await.len()
    }
}

impl Store for MemoryStore {
    fn save_workflow(&self, def: &WorkflowDefinition) -> BoxFuture<'_, Result<()>> {
        let def = def.clone();
        Box::pin(async move {
            self.workflows.lock().await.insert(def.id.clone(), def);
            Ok(())
        })
    }

    fn save_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            self.executions
                .lock()
                .await
                .insert(execution.id.clone(), execution);
            Ok(())
        })
    }

    fn save_step_execution(
        &self,
        execution_id: &ExecutionId,
        step: &StepExecution,
    ) -> BoxFuture<'_, Result<()>> {
        let execution_id = execution_id.clone();
        let step = step.clone();
        Box::pin(async move {
            self.steps
                .lock()
                .await
                .entry(execution_id)
                .or_default()
                .insert(step.id.clone(), step);
            Ok(())
        })
    }

    fn save_approval(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        let request = request.clone();
        Box::pin(async move {
            self.approvals
                .lock()
                .await
                .insert(request.id.clone(), request);
            Ok(())
        })
    }

    fn load_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.executions.lock().await.get(&id).cloned()) })
    }

    fn load_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.workflows.lock().await.get(&id).cloned()) })
    }

    fn load_approval(&self, id: &str) -> BoxFuture<'_, Result<Option<ApprovalRequest>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.approvals.lock().await.get(&id).cloned()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::types::{ExecutionContext, StepStatus};
    use tessera_core::workflow::WorkflowStep;

    #[tokio::test]
    async fn writes_are_upserts() {
        let store = MemoryStore::new();
        let mut exec = Execution::new("w", ExecutionContext::default());
        store.save_execution(&exec).await.unwrap();

        exec.status = tessera_core::types::ExecutionStatus::Completed;
        store.save_execution(&exec).await.unwrap();

        assert_eq!(store.execution_count().await, 1);
        let loaded = store.load_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, tessera_core::types::ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn step_records_by_execution() {
        let store = MemoryStore::new();
        let id = ExecutionId::new();
        let mut record = StepExecution::new("a");
        store.save_step_execution(&id, &record).await.unwrap();
        record.transition(StepStatus::Running).unwrap();
        store.save_step_execution(&id, &record).await.unwrap();

        let records = store.step_records(&id).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, StepStatus::Running);
        assert!(store.step_records(&ExecutionId::new()).await.is_empty());
    }

    #[tokio::test]
    async fn workflow_roundtrip() {
        let store = MemoryStore::new();
        let def = WorkflowDefinition::new("w")
            .with_id("wf-1")
            .with_step(WorkflowStep::new("a", "echo"));
        store.save_workflow(&def).await.unwrap();
        assert_eq!(store.load_workflow("wf-1").await.unwrap().unwrap().steps.len(), 1);
        assert!(store.load_workflow("missing").await.unwrap().is_none());
    }
}
