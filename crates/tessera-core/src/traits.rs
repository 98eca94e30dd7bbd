use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ApprovalRequest, Execution, ExecutionId, Notification, StepExecution};
use crate::workflow::WorkflowDefinition;

/// Executes named actions on behalf of workflow steps.
///
/// The engine treats the action as opaque; only success or failure matters.
pub trait Agent: Send + Sync + 'static {
    /// Agent name (used for `step.agent` overrides and in records).
    fn name(&self) -> &str;

    /// Actions this agent serves. Empty means it is only reachable by name.
    fn actions(&self) -> Vec<String> {
        vec![]
    }

    /// Execute an action with resolved parameters and a snapshot of the
    /// execution's variables.
    fn execute(
        &self,
        action: &str,
        parameters: serde_json::Value,
        context: HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Durable record of workflow and execution state.
///
/// Writes may be repeated; implementations must treat a second write of the
/// same record as an update.
pub trait Store: Send + Sync + 'static {
    fn save_workflow(&self, def: &WorkflowDefinition) -> BoxFuture<'_, Result<()>>;

    fn save_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>>;

    fn save_step_execution(
        &self,
        execution_id: &ExecutionId,
        step: &StepExecution,
    ) -> BoxFuture<'_, Result<()>>;

    fn save_approval(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>>;

    fn load_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>>;

    fn load_approval(&self, id: &str) -> BoxFuture<'_, Result<Option<ApprovalRequest>>>;

    fn load_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>>;
}

/// Fire-and-forget delivery of approval and completion alerts.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, notification: Notification) -> BoxFuture<'_, Result<()>>;
}
