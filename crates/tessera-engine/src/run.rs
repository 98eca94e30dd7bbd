//! Per-execution state shared between the coordinator and its processors.
//!
//! The `Execution` record lives behind one `RwLock` owned by the handle.
//! Every step transition goes through the methods here so the status rules,
//! the transition log, events, metrics, and persistence stay in step.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tessera_core::error::{Result, TesseraError};
use tessera_core::event::EventBus;
use tessera_core::traits::Store;
use tessera_core::types::{
    EngineEvent, Execution, ExecutionId, ExecutionStatus, StepExecution, StepStatus,
};

use crate::compile::CompiledWorkflow;
use crate::metrics::MetricsRecorder;

/// Reasons to re-examine an execution that is waiting.
#[derive(Debug, Clone)]
pub enum Wake {
    ApprovalResolved { approval_id: String },
    TaskFired { task_id: String },
    ContextChanged,
}

pub struct ExecutionHandle {
    pub id: ExecutionId,
    pub workflow: Arc<CompiledWorkflow>,
    state: RwLock<Execution>,
    /// Cancels the whole execution.
    pub cancel: CancellationToken,
    /// Child of `cancel`; disarms this execution's timers at finalization.
    pub timers: CancellationToken,
    wake_tx: mpsc::UnboundedSender<Wake>,
    finished: watch::Sender<Option<ExecutionStatus>>,
    events: Arc<EventBus>,
    store: Arc<dyn Store>,
    metrics: Arc<MetricsRecorder>,
}

impl ExecutionHandle {
    pub fn new(
        workflow: Arc<CompiledWorkflow>,
        execution: Execution,
        events: Arc<EventBus>,
        store: Arc<dyn Store>,
        metrics: Arc<MetricsRecorder>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Wake>) {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (finished, _) = watch::channel(None);
        let cancel = CancellationToken::new();
        let timers = cancel.child_token();
        let handle = Arc::new(Self {
            id: execution.id.clone(),
            workflow,
            state: RwLock::new(execution),
            cancel,
            timers,
            wake_tx,
            finished,
            events,
            store,
            metrics,
        });
        (handle, wake_rx)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn wake(&self, reason: Wake) {
        // The receiver is gone once the drive loop has finished.
        let _ = self.wake_tx.send(reason);
    }

    pub async fn snapshot(&self) -> Execution {
        self.state.read().await.clone()
    }

    pub async fn variables(&self) -> HashMap<String, Value> {
        self.state.read().await.context.variables.clone()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&Execution) -> R) -> R {
        f(&*self.state.read().await)
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut Execution) -> R) -> R {
        f(&mut *self.state.write().await)
    }

    pub async fn step_status(&self, step_id: &str) -> StepStatus {
        self.state.read().await.context.step_status(step_id)
    }

    /// Merge external bindings into the context and wake the coordinator.
    pub async fn merge_variables(&self, vars: HashMap<String, Value>) {
        self.state.write().await.context.variables.extend(vars);
        self.wake(Wake::ContextChanged);
    }

    /// Create a running record for a new step run. Returns the record id.
    pub async fn begin_step(&self, step_id: &str, agent: &str, iteration: Option<u32>) -> Result<String> {
        let record = {
            let mut exec = self.state.write().await;
            let mut record = StepExecution::new(step_id);
            record.agent = Some(agent.to_string());
            record.iteration = iteration;
            record.transition(StepStatus::Running)?;
            let record_id = record.id.clone();
            exec.steps.push(record.clone());
            exec.log_transition(step_id, &record_id, StepStatus::Running);
            exec.metrics.total_steps_executed += 1;
            record
        };
        self.metrics.step_started();
        debug!(execution_id = %self.id, step_id, agent, "Step started");
        self.events.publish(EngineEvent::StepStarted {
            execution_id: self.id.clone(),
            step_id: step_id.to_string(),
            attempt: 1,
        });
        self.persist_step(&record).await;
        Ok(record.id)
    }

    /// Move a failed record back to running for another attempt.
    pub async fn retry_step(&self, record_id: &str) -> Result<u32> {
        let record = self
            .transition(record_id, StepStatus::Running, |exec, _| {
                exec.metrics.retry_count += 1;
            })
            .await?;
        self.metrics.step_retry();
        self.events.publish(EngineEvent::StepStarted {
            execution_id: self.id.clone(),
            step_id: record.step_id.clone(),
            attempt: record.retry_count + 1,
        });
        Ok(record.retry_count)
    }

    /// Record a failed attempt.
    pub async fn fail_step(&self, record_id: &str, error: &TesseraError) -> Result<()> {
        let message = error.to_string();
        let record = self
            .transition(record_id, StepStatus::Failed, |exec, rec_idx| {
                exec.steps[rec_idx].error = Some(message.clone());
                exec.metrics.error_count += 1;
                let status_key = format!("{}_status", exec.steps[rec_idx].step_id);
                exec.context
                    .variables
                    .insert(status_key, Value::String(StepStatus::Failed.to_string()));
            })
            .await?;
        self.metrics.step_error();
        self.events.publish(EngineEvent::StepFailed {
            execution_id: self.id.clone(),
            step_id: record.step_id,
            error: message,
        });
        Ok(())
    }

    /// Record success and bind the result into the context.
    pub async fn complete_step(&self, record_id: &str, result: Value, output_variable: Option<&str>) -> Result<()> {
        let record = self
            .transition(record_id, StepStatus::Completed, |exec, rec_idx| {
                let step_id = exec.steps[rec_idx].step_id.clone();
                exec.steps[rec_idx].result = Some(result.clone());
                let vars = &mut exec.context.variables;
                if let Some(name) = output_variable {
                    vars.insert(name.to_string(), result.clone());
                }
                vars.insert(
                    format!("{}_status", step_id),
                    Value::String(StepStatus::Completed.to_string()),
                );
                vars.insert(step_id, result);
            })
            .await?;
        self.events.publish(EngineEvent::StepCompleted {
            execution_id: self.id.clone(),
            step_id: record.step_id.clone(),
            elapsed_ms: record.duration_ms().unwrap_or(0),
        });
        self.wake(Wake::ContextChanged);
        Ok(())
    }

    pub async fn cancel_step(&self, record_id: &str) -> Result<()> {
        self.transition(record_id, StepStatus::Cancelled, |_, _| {})
            .await
            .map(|_| ())
    }

    /// Mark a step skipped if it has not run yet. Returns whether it was.
    pub async fn skip_step(&self, step_id: &str, reason: &str) -> bool {
        let record = {
            let mut exec = self.state.write().await;
            if exec.context.step_status(step_id) != StepStatus::Pending {
                return false;
            }
            let mut record = StepExecution::new(step_id);
            if record.transition(StepStatus::Skipped).is_err() {
                return false;
            }
            record.error = Some(reason.to_string());
            let record_id = record.id.clone();
            exec.steps.push(record.clone());
            exec.log_transition(step_id, &record_id, StepStatus::Skipped);
            exec.context.variables.insert(
                format!("{}_status", step_id),
                Value::String(StepStatus::Skipped.to_string()),
            );
            record
        };
        debug!(execution_id = %self.id, step_id, reason, "Step skipped");
        self.events.publish(EngineEvent::StepSkipped {
            execution_id: self.id.clone(),
            step_id: step_id.to_string(),
            reason: reason.to_string(),
        });
        self.persist_step(&record).await;
        true
    }

    /// Fail a step whose driving task died without reporting. The running
    /// record is failed if there is one; otherwise a failed record is added.
    pub async fn fail_abandoned(&self, step_id: &str, error: &TesseraError) -> Result<()> {
        let running = self
            .read(|exec| {
                exec.steps
                    .iter()
                    .rev()
                    .find(|s| s.step_id == step_id && s.status == StepStatus::Running)
                    .map(|s| s.id.clone())
            })
            .await;
        let record_id = match running {
            Some(id) => id,
            None if self.step_status(step_id).await == StepStatus::Pending => {
                self.begin_step(step_id, "unknown", None).await?
            }
            None => return Ok(()),
        };
        self.fail_step(&record_id, error).await
    }

    /// Record that a failure is accepted by its owning construct.
    pub async fn tolerate(&self, step_id: &str) {
        self.state
            .write()
            .await
            .context
            .tolerated_failures
            .insert(step_id.to_string());
    }

    /// Mark every running record cancelled.
    pub async fn cancel_running_steps(&self) {
        let cancelled: Vec<StepExecution> = {
            let mut exec = self.state.write().await;
            let running: Vec<usize> = exec
                .steps
                .iter()
                .enumerate()
                .filter(|(_, s)| s.status == StepStatus::Running)
                .map(|(i, _)| i)
                .collect();
            let mut out = Vec::new();
            for i in running {
                if exec.steps[i].transition(StepStatus::Cancelled).is_ok() {
                    let (step_id, record_id) = (exec.steps[i].step_id.clone(), exec.steps[i].id.clone());
                    exec.log_transition(&step_id, &record_id, StepStatus::Cancelled);
                    out.push(exec.steps[i].clone());
                }
            }
            out
        };
        for record in &cancelled {
            self.persist_step(record).await;
        }
    }

    async fn transition(
        &self,
        record_id: &str,
        next: StepStatus,
        apply: impl FnOnce(&mut Execution, usize),
    ) -> Result<StepExecution> {
        let record = {
            let mut exec = self.state.write().await;
            let idx = exec
                .steps
                .iter()
                .position(|s| s.id == record_id)
                .ok_or_else(|| TesseraError::Validation(format!("unknown step record: {}", record_id)))?;
            exec.steps[idx].transition(next)?;
            apply(&mut *exec, idx);
            let step_id = exec.steps[idx].step_id.clone();
            exec.log_transition(&step_id, record_id, next);
            exec.steps[idx].clone()
        };
        self.persist_step(&record).await;
        Ok(record)
    }

    async fn persist_step(&self, record: &StepExecution) {
        if let Err(e) = self.store.save_step_execution(&self.id, record).await {
            warn!(execution_id = %self.id, step_id = %record.step_id, error = %e, "Failed to persist step");
        }
    }

    /// Save the current snapshot. Failures are logged; returns whether the
    /// write went through.
    pub async fn persist(&self) -> bool {
        let snapshot = self.snapshot().await;
        match self.store.save_execution(&snapshot).await {
            Ok(()) => true,
            Err(e) => {
                warn!(execution_id = %self.id, error = %e, "Failed to persist execution");
                false
            }
        }
    }

    pub fn mark_finished(&self, status: ExecutionStatus) {
        self.finished.send_replace(Some(status));
    }

    /// Resolves once the execution reaches a terminal status.
    pub async fn wait_finished(&self) -> ExecutionStatus {
        let mut rx = self.finished.subscribe();
        loop {
            if let Some(status) = *rx.borrow_and_update() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.state.read().await.status;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::types::ExecutionContext;
    use tessera_core::workflow::{WorkflowDefinition, WorkflowStep};
    use tessera_store::MemoryStore;

    fn handle() -> Arc<ExecutionHandle> {
        let def = WorkflowDefinition::new("w").with_step(WorkflowStep::new("a", "echo"));
        let compiled = Arc::new(CompiledWorkflow::compile(def).unwrap());
        let exec = Execution::new("w", ExecutionContext::default());
        let (h, _rx) = ExecutionHandle::new(
            compiled,
            exec,
            Arc::new(EventBus::default()),
            Arc::new(MemoryStore::new()),
            Arc::new(MetricsRecorder::default()),
        );
        h
    }

    #[tokio::test]
    async fn lifecycle_binds_outputs() {
        let h = handle();
        let rec = h.begin_step("a", "echo", None).await.unwrap();
        h.complete_step(&rec, serde_json::json!({"v": 1}), Some("out"))
            .await
            .unwrap();

        let exec = h.snapshot().await;
        assert_eq!(exec.context.step_status("a"), StepStatus::Completed);
        assert_eq!(exec.context.variables["a"]["v"], 1);
        assert_eq!(exec.context.variables["out"]["v"], 1);
        assert_eq!(exec.context.variables["a_status"], "completed");
        assert_eq!(exec.history.len(), 2);
        assert_eq!(exec.metrics.total_steps_executed, 1);
    }

    #[tokio::test]
    async fn retry_edge_counts() {
        let h = handle();
        let rec = h.begin_step("a", "echo", None).await.unwrap();
        h.fail_step(&rec, &TesseraError::Agent("boom".into())).await.unwrap();
        assert_eq!(h.retry_step(&rec).await.unwrap(), 1);
        h.fail_step(&rec, &TesseraError::Agent("boom".into())).await.unwrap();

        let exec = h.snapshot().await;
        assert_eq!(exec.metrics.error_count, 2);
        assert_eq!(exec.metrics.retry_count, 1);
        assert_eq!(exec.steps.len(), 1);
        assert_eq!(exec.steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn skip_only_untouched_steps() {
        let h = handle();
        assert!(h.skip_step("a", "branch_not_taken").await);
        assert!(!h.skip_step("a", "again").await);
        assert_eq!(h.step_status("a").await, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn abandoned_step_is_failed() {
        let h = handle();
        h.begin_step("a", "echo", None).await.unwrap();
        let err = TesseraError::Agent("task died".into());
        h.fail_abandoned("a", &err).await.unwrap();
        let exec = h.snapshot().await;
        assert_eq!(exec.context.step_status("a"), StepStatus::Failed);
        assert_eq!(exec.steps.len(), 1);
        assert_eq!(exec.steps[0].error.as_deref(), Some("Agent error: task died"));
    }

    #[tokio::test]
    async fn cancel_running() {
        let h = handle();
        h.begin_step("a", "echo", None).await.unwrap();
        h.cancel_running_steps().await;
        assert_eq!(h.step_status("a").await, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn wait_finished_resolves() {
        let h = handle();
        let waiter = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.wait_finished().await })
        };
        h.mark_finished(ExecutionStatus::Completed);
        assert_eq!(waiter.await.unwrap(), ExecutionStatus::Completed);
    }
}
