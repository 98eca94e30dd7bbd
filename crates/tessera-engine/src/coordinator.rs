//! The execution coordinator.
//!
//! `Engine` owns workflow definitions and executions. Each execution is
//! driven by its own task: units of the compiled plan are dispatched in
//! topological order as their requirements settle, approval and schedule
//! gates park steps until a wake-up releases them, and finalization disarms
//! every timer the execution armed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tracing::{error, info, warn};

use tessera_core::config::EngineConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::event::EventBus;
use tessera_core::traits::{Notifier, Store};
use tessera_core::types::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, EngineEvent, Execution, ExecutionContext,
    ExecutionError, ExecutionId, ExecutionStatus, Notification, OrchestrationMetrics, StepStatus,
};
use tessera_core::workflow::{TimeoutAction, WorkflowDefinition};
use tessera_store::MemoryStore;

use crate::approval::ApprovalBroker;
use crate::compile::{CompiledWorkflow, Unit, UnitPlan};
use crate::executor::StepExecutor;
use crate::flow::FlowProcessor;
use crate::metrics::MetricsRecorder;
use crate::notify;
use crate::registry::AgentRegistry;
use crate::run::{ExecutionHandle, Wake};
use crate::scheduler::TaskScheduler;
use crate::variables::validate_inputs;

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    agents: Option<AgentRegistry>,
    store: Option<Arc<dyn Store>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            agents: None,
            store: None,
            notifier: None,
        }
    }

    pub fn with_agents(mut self, agents: AgentRegistry) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Engine {
        let events = Arc::new(EventBus::new(self.config.engine.event_capacity.max(1)));
        let notifier = self
            .notifier
            .unwrap_or_else(|| notify::from_config(&self.config.notifications));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let agents = Arc::new(self.agents.unwrap_or_else(AgentRegistry::with_builtins));
        let executor = Arc::new(StepExecutor::new(
            agents,
            self.config.retry.clone(),
            self.config.engine.default_step_timeout(),
        ));

        Engine {
            inner: Arc::new(EngineInner {
                workflows: RwLock::new(HashMap::new()),
                executions: RwLock::new(HashMap::new()),
                flow: FlowProcessor::new(executor),
                approvals: Arc::new(ApprovalBroker::new(
                    Arc::clone(&events),
                    Arc::clone(&notifier),
                )),
                scheduler: TaskScheduler::new(Arc::clone(&events)),
                events,
                store,
                notifier,
                metrics: Arc::new(MetricsRecorder::default()),
                config: self.config,
            }),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    workflows: RwLock<HashMap<String, Arc<CompiledWorkflow>>>,
    executions: RwLock<HashMap<ExecutionId, Arc<ExecutionHandle>>>,
    flow: FlowProcessor,
    approvals: Arc<ApprovalBroker>,
    scheduler: TaskScheduler,
    events: Arc<EventBus>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<MetricsRecorder>,
}

/// Workflow engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Validate and register a definition. Returns its id.
    ///
    /// A definition without an id gets a generated one. Ids are never reused.
    pub async fn create_workflow(&self, mut def: WorkflowDefinition) -> Result<String> {
        if def.id.is_empty() {
            def.id = uuid::Uuid::new_v4().to_string();
        }
        let id = def.id.clone();
        let compiled = Arc::new(CompiledWorkflow::compile(def)?);

        {
            let mut workflows = self.inner.workflows.write().await;
            if workflows.contains_key(&id) {
                return Err(TesseraError::Validation(format!(
                    "workflow {} already exists",
                    id
                )));
            }
            workflows.insert(id.clone(), Arc::clone(&compiled));
        }

        if let Err(e) = self.inner.store.save_workflow(&compiled.def).await {
            warn!(workflow_id = %id, error = %e, "Failed to persist workflow");
        }
        self.inner.metrics.workflow_created();
        self.inner.events.publish(EngineEvent::WorkflowCreated {
            workflow_id: id.clone(),
        });
        info!(
            workflow_id = %id,
            name = %compiled.def.name,
            steps = compiled.def.steps.len(),
            units = compiled.plan.len(),
            "Workflow created"
        );
        Ok(id)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.inner
            .workflows
            .read()
            .await
            .get(workflow_id)
            .map(|w| w.def.clone())
    }

    /// Start an execution. Input validation errors are returned here and no
    /// execution is created.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionId> {
        let workflow = self
            .inner
            .workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| TesseraError::WorkflowNotFound(workflow_id.to_string()))?;

        let variables = validate_inputs(&workflow.def.variables, inputs)?;
        let execution = Execution::new(workflow_id, ExecutionContext::new(variables));
        let (run, wake_rx) = ExecutionHandle::new(
            workflow,
            execution,
            Arc::clone(&self.inner.events),
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.metrics),
        );
        let id = run.id.clone();

        self.inner
            .executions
            .write()
            .await
            .insert(id.clone(), Arc::clone(&run));
        self.inner.metrics.execution_started();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_execution(inner, run, wake_rx).await;
        });
        Ok(id)
    }

    /// Latest known state of an execution.
    ///
    /// Finished executions are dropped from memory once persisted and are
    /// answered from the store.
    pub async fn get_execution(&self, execution_id: &ExecutionId) -> Result<Execution> {
        if let Some(run) = self.handle(execution_id).await {
            return Ok(run.snapshot().await);
        }
        self.stored_execution(execution_id).await
    }

    /// Resolves once the execution is terminal and returns its final state.
    pub async fn wait_for_execution(&self, execution_id: &ExecutionId) -> Result<Execution> {
        if let Some(run) = self.handle(execution_id).await {
            run.wait_finished().await;
            return Ok(run.snapshot().await);
        }
        let exec = self.stored_execution(execution_id).await?;
        if exec.status.is_terminal() {
            Ok(exec)
        } else {
            // Left running by another engine; nothing here will finish it.
            Err(TesseraError::ExecutionNotFound(execution_id.to_string()))
        }
    }

    pub async fn submit_approval(
        &self,
        approval_id: &str,
        approver: &str,
        decision: ApprovalDecision,
    ) -> Result<ApprovalStatus> {
        match self
            .inner
            .approvals
            .submit(approval_id, approver, decision)
            .await
        {
            // Requests of finished executions only live in the store.
            Err(TesseraError::ApprovalNotFound(id)) => match self.stored_approval(&id).await {
                Some(_) => Err(TesseraError::ApprovalClosed(id)),
                None => Err(TesseraError::ApprovalNotFound(id)),
            },
            other => other,
        }
    }

    pub async fn get_approval(&self, approval_id: &str) -> Option<ApprovalRequest> {
        match self.inner.approvals.get(approval_id).await {
            Some(request) => Some(request),
            None => self.stored_approval(approval_id).await,
        }
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.inner.approvals.pending_requests().await
    }

    /// Cancel a running execution. Terminal executions are left alone.
    pub async fn cancel_execution(&self, execution_id: &ExecutionId) -> Result<()> {
        let Some(run) = self.handle(execution_id).await else {
            let exec = self.stored_execution(execution_id).await?;
            return if exec.status.is_terminal() {
                Ok(())
            } else {
                Err(TesseraError::ExecutionNotFound(execution_id.to_string()))
            };
        };
        if run.read(|exec| exec.status.is_terminal()).await {
            return Ok(());
        }
        info!(execution_id = %execution_id, "Cancelling execution");
        run.cancel.cancel();
        Ok(())
    }

    /// Merge variables into a running execution's context. Condition gates
    /// are re-evaluated right away.
    pub async fn update_variables(
        &self,
        execution_id: &ExecutionId,
        vars: HashMap<String, Value>,
    ) -> Result<()> {
        let Some(run) = self.handle(execution_id).await else {
            self.stored_execution(execution_id).await?;
            return Err(TesseraError::Validation(format!(
                "execution {} has finished",
                execution_id
            )));
        };
        if run.read(|exec| exec.status.is_terminal()).await {
            return Err(TesseraError::Validation(format!(
                "execution {} has finished",
                execution_id
            )));
        }
        run.merge_variables(vars).await;
        Ok(())
    }

    pub fn get_metrics(&self) -> OrchestrationMetrics {
        self.inner.metrics.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    async fn handle(&self, execution_id: &ExecutionId) -> Option<Arc<ExecutionHandle>> {
        self.inner
            .executions
            .read()
            .await
            .get(execution_id)
            .cloned()
    }

    async fn stored_execution(&self, execution_id: &ExecutionId) -> Result<Execution> {
        self.inner
            .store
            .load_execution(execution_id)
            .await?
            .ok_or_else(|| TesseraError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn stored_approval(&self, approval_id: &str) -> Option<ApprovalRequest> {
        match self.inner.store.load_approval(approval_id).await {
            Ok(request) => request,
            Err(e) => {
                warn!(approval_id, error = %e, "Failed to load approval");
                None
            }
        }
    }
}

async fn run_execution(
    inner: Arc<EngineInner>,
    run: Arc<ExecutionHandle>,
    wake_rx: mpsc::UnboundedReceiver<Wake>,
) {
    run.update(|exec| {
        exec.status = ExecutionStatus::Running;
        exec.started_at = Some(Utc::now());
    })
    .await;
    run.persist().await;
    inner.events.publish(EngineEvent::ExecutionStarted {
        execution_id: run.id.clone(),
        workflow_id: run.workflow.id().to_string(),
    });
    info!(execution_id = %run.id, workflow_id = %run.workflow.id(), "Execution started");

    let limit_secs = run
        .workflow
        .def
        .timeout_secs
        .unwrap_or(inner.config.engine.workflow_timeout_secs);
    let outcome = match tokio::time::timeout(
        Duration::from_secs(limit_secs),
        Driver::new(&inner, &run, wake_rx).drive(),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(TesseraError::WorkflowTimeout(limit_secs)),
    };

    if finalize(&inner, &run, outcome).await {
        inner.executions.write().await.remove(&run.id);
    }
}

enum Readiness {
    Waiting,
    Ready,
    Blocked(String),
}

struct Driver<'a> {
    inner: &'a EngineInner,
    run: &'a Arc<ExecutionHandle>,
    wake_rx: mpsc::UnboundedReceiver<Wake>,
    dispatched: HashSet<String>,
    /// Approval or task id to the step it holds back.
    gated: HashMap<String, String>,
    released: VecDeque<String>,
}

impl<'a> Driver<'a> {
    fn new(
        inner: &'a EngineInner,
        run: &'a Arc<ExecutionHandle>,
        wake_rx: mpsc::UnboundedReceiver<Wake>,
    ) -> Self {
        Self {
            inner,
            run,
            wake_rx,
            dispatched: HashSet::new(),
            gated: HashMap::new(),
            released: VecDeque::new(),
        }
    }

    async fn drive(mut self) -> Result<()> {
        let wait_limit = self.inner.config.engine.dependency_wait_timeout();
        let mut last_progress = Instant::now();

        loop {
            if self.run.cancel.is_cancelled() {
                return Err(TesseraError::Cancelled);
            }
            if self.advance().await? {
                last_progress = Instant::now();
                continue;
            }

            let plan = &self.run.workflow.plan;
            if self.gated.is_empty() {
                if plan.iter().all(|u| self.dispatched.contains(&u.key)) {
                    return Ok(());
                }
                // Nothing runnable and nothing that could release it.
                return Err(TesseraError::DependencyWaitTimeout {
                    waited_secs: last_progress.elapsed().as_secs(),
                });
            }

            let poll = self
                .inner
                .scheduler
                .poll_interval(&self.run.id, self.inner.config.engine.condition_poll_interval())
                .await;
            let cancel = self.run.cancel.clone();
            tokio::select! {
                _ = cancel.cancelled() => return Err(TesseraError::Cancelled),
                msg = self.wake_rx.recv() => {
                    if let Some(msg) = msg {
                        self.on_wake(msg).await?;
                    }
                    while let Ok(msg) = self.wake_rx.try_recv() {
                        self.on_wake(msg).await?;
                    }
                }
                _ = tokio::time::sleep(poll.unwrap_or(Duration::ZERO)), if poll.is_some() => {}
                _ = tokio::time::sleep_until(last_progress + wait_limit) => {
                    warn!(execution_id = %self.run.id, gated = self.gated.len(), "Gave up waiting on gated steps");
                    return Err(TesseraError::DependencyWaitTimeout {
                        waited_secs: wait_limit.as_secs(),
                    });
                }
            }
        }
    }

    /// Do one piece of work. Returns false when nothing could be done.
    async fn advance(&mut self) -> Result<bool> {
        if let Some(step_id) = self.released.pop_front() {
            self.run_step(&step_id).await?;
            return Ok(true);
        }

        for task_id in self.inner.scheduler.poll_conditions(self.run).await {
            self.release(&task_id);
        }
        if !self.released.is_empty() {
            return Ok(true);
        }

        let run = self.run;
        for unit in &run.workflow.plan {
            if self.dispatched.contains(&unit.key) {
                continue;
            }
            match run.read(|exec| readiness(exec, unit)).await {
                Readiness::Waiting => continue,
                Readiness::Blocked(dep) => {
                    self.dispatched.insert(unit.key.clone());
                    info!(execution_id = %run.id, unit = %unit.key, dependency = %dep, "Unit skipped, dependency failed");
                    for member in &unit.members {
                        run.skip_step(member, "dependency_failed").await;
                    }
                    return Ok(true);
                }
                Readiness::Ready => {
                    self.dispatched.insert(unit.key.clone());
                    match &unit.unit {
                        Unit::Step(step_id) => self.dispatch_step(step_id).await?,
                        Unit::Construct(construct) => {
                            self.inner.flow.process(run, construct).await?
                        }
                    }
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Run a top-level step, or park it behind its approval or schedule.
    async fn dispatch_step(&mut self, step_id: &str) -> Result<()> {
        let workflow = &self.run.workflow;
        if let Some(rule) = workflow.approval_for(step_id) {
            let request = self.inner.approvals.request(self.run, rule).await?;
            if request.status == ApprovalStatus::Approved {
                return self.run_step(step_id).await;
            }
            self.gated.insert(request.id, step_id.to_string());
            return Ok(());
        }
        if let Some(rule) = workflow.schedule_for(step_id) {
            let task = self.inner.scheduler.schedule(self.run, rule).await?;
            self.gated.insert(task.id, step_id.to_string());
            return Ok(());
        }
        self.run_step(step_id).await
    }

    async fn run_step(&self, step_id: &str) -> Result<()> {
        let step = self.run.workflow.step(step_id)?;
        self.inner
            .flow
            .executor()
            .execute(self.run, step, None)
            .await
            .map(|_| ())
    }

    fn release(&mut self, gate_id: &str) {
        if let Some(step_id) = self.gated.remove(gate_id) {
            self.released.push_back(step_id);
        }
    }

    async fn on_wake(&mut self, msg: Wake) -> Result<()> {
        match msg {
            Wake::TaskFired { task_id } => {
                if self.gated.contains_key(&task_id)
                    && self.inner.scheduler.mark_fired(self.run, &task_id).await
                {
                    self.release(&task_id);
                }
            }
            Wake::ApprovalResolved { approval_id } => {
                let Some(step_id) = self.gated.remove(&approval_id) else {
                    return Ok(());
                };
                let status = self
                    .inner
                    .approvals
                    .get(&approval_id)
                    .await
                    .map(|r| r.status)
                    .unwrap_or(ApprovalStatus::Pending);
                match status {
                    ApprovalStatus::Approved => self.released.push_back(step_id),
                    ApprovalStatus::Rejected => {
                        self.run.skip_step(&step_id, "approval_rejected").await;
                        return Err(TesseraError::ApprovalRejected {
                            approval: approval_id,
                        });
                    }
                    ApprovalStatus::Timeout => {
                        let action = self
                            .run
                            .workflow
                            .approval_for(&step_id)
                            .map(|r| r.on_timeout)
                            .unwrap_or_default();
                        self.run.skip_step(&step_id, "approval_timeout").await;
                        if action == TimeoutAction::Fail {
                            return Err(TesseraError::ApprovalTimeout {
                                approval: approval_id,
                            });
                        }
                    }
                    ApprovalStatus::Pending => {
                        self.gated.insert(approval_id, step_id);
                    }
                }
            }
            Wake::ContextChanged => {}
        }
        Ok(())
    }
}

fn readiness(exec: &Execution, unit: &UnitPlan) -> Readiness {
    let statuses: Vec<(&String, StepStatus)> = unit
        .requires
        .iter()
        .map(|d| (d, exec.context.step_status(d)))
        .collect();
    if let Some((dep, _)) = statuses
        .iter()
        .find(|(_, s)| matches!(s, StepStatus::Failed | StepStatus::Cancelled))
    {
        return Readiness::Blocked((*dep).clone());
    }
    if statuses.iter().all(|(_, s)| s.satisfies_dependency()) {
        Readiness::Ready
    } else {
        Readiness::Waiting
    }
}

fn failing_step(err: &TesseraError) -> Option<String> {
    match err {
        TesseraError::StepFailure { step, .. } | TesseraError::StepTimeout { step, .. } => {
            Some(step.clone())
        }
        _ => None,
    }
}

/// Settle the execution's final state. Returns whether it was persisted.
async fn finalize(inner: &EngineInner, run: &Arc<ExecutionHandle>, outcome: Result<()>) -> bool {
    run.timers.cancel();
    inner.approvals.disarm_execution(&run.id).await;
    inner.scheduler.disarm_execution(run).await;
    run.cancel_running_steps().await;
    run.cancel.cancel();

    let (status, duration_ms) = run
        .update(|exec| {
            let untolerated = first_unrecovered_failure(exec);

            let (status, error) = match &outcome {
                Ok(()) => match untolerated {
                    None => (ExecutionStatus::Completed, None),
                    Some(step_id) => {
                        let message = exec
                            .latest_step(&step_id)
                            .and_then(|s| s.error.clone())
                            .unwrap_or_else(|| "step failed".into());
                        let err = TesseraError::StepFailure {
                            step: step_id.clone(),
                            message,
                        };
                        (
                            ExecutionStatus::Failed,
                            Some(ExecutionError::from_error(&err, Some(step_id))),
                        )
                    }
                },
                Err(TesseraError::Cancelled) => (
                    ExecutionStatus::Cancelled,
                    Some(ExecutionError::from_error(&TesseraError::Cancelled, None)),
                ),
                Err(e) => (
                    ExecutionStatus::Failed,
                    Some(ExecutionError::from_error(e, failing_step(e))),
                ),
            };

            let now = Utc::now();
            exec.status = status;
            exec.error = error;
            exec.ended_at = Some(now);
            let duration_ms = exec
                .started_at
                .map(|s| (now - s).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            exec.metrics.duration_ms = Some(duration_ms);
            (status, duration_ms)
        })
        .await;

    let persisted = run.persist().await;
    inner.metrics.execution_finished(status, duration_ms);
    inner.events.publish(EngineEvent::ExecutionFinished {
        execution_id: run.id.clone(),
        status,
    });

    match &outcome {
        Err(e) if status == ExecutionStatus::Failed => {
            error!(execution_id = %run.id, error = %e, duration_ms, "Execution failed")
        }
        _ => info!(execution_id = %run.id, status = %status, duration_ms, "Execution finished"),
    }

    let def = &run.workflow.def;
    if !def.notify_on_completion.is_empty() {
        notify::dispatch(
            &inner.notifier,
            Notification {
                recipients: def.notify_on_completion.clone(),
                template: "execution_finished".into(),
                channel: inner.config.notifications.default_channel.clone(),
                priority: def.priority,
                data: serde_json::json!({
                    "execution_id": run.id,
                    "workflow_id": def.id,
                    "status": status,
                    "duration_ms": duration_ms,
                }),
            },
        );
    }

    run.mark_finished(status);
    persisted
}

/// The step whose failure came first among those still failed and not
/// tolerated by their construct.
fn first_unrecovered_failure(exec: &Execution) -> Option<String> {
    exec.history
        .iter()
        .filter(|t| t.status == StepStatus::Failed)
        .map(|t| &t.step_id)
        .find(|id| {
            exec.context.step_status(id) == StepStatus::Failed
                && !exec.context.tolerated_failures.contains(*id)
        })
        .cloned()
}
