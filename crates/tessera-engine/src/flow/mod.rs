//! Control-flow processing: conditional branches, bounded loops, and
//! parallel groups.
//!
//! Each construct is processed at most once per execution. Re-entry is a
//! no-op once the context holds a recorded result for it (branch history,
//! loop result, or parallel group result).

mod branch;
mod loops;
mod parallel;

use std::sync::Arc;

use tracing::debug;

use tessera_core::error::{Result, TesseraError};
use tessera_core::types::{Execution, StepStatus};
use tessera_core::workflow::{ConstructRef, FailureStrategy, WorkflowStep};

use crate::executor::StepExecutor;
use crate::run::ExecutionHandle;

pub struct FlowProcessor {
    executor: Arc<StepExecutor>,
}

/// How a sequential run of steps ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SequenceEnd {
    Finished,
    /// A `continue_condition` cut the sequence short.
    ContinuedEarly,
}

impl FlowProcessor {
    pub fn new(executor: Arc<StepExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    /// Drive one construct to completion.
    pub async fn process(&self, run: &Arc<ExecutionHandle>, construct: &ConstructRef) -> Result<()> {
        debug!(execution_id = %run.id, construct = %construct, "Processing construct");
        match construct {
            ConstructRef::Branch(id) => self.run_branch(run, id).await,
            ConstructRef::Loop(id) => self.run_loop(run, id).await,
            ConstructRef::Parallel(id) => self.run_parallel(run, id).await,
        }
    }

    /// Run steps one after another under a construct's failure strategy.
    ///
    /// A step whose dependency failed or was cancelled is not run. Under
    /// `continue` a failure is tolerated and the sequence moves on; under
    /// the other strategies it is returned.
    pub(crate) async fn run_sequence(
        &self,
        run: &ExecutionHandle,
        steps: &[String],
        strategy: FailureStrategy,
        iteration: Option<u32>,
        continue_condition: Option<&str>,
    ) -> Result<SequenceEnd> {
        for id in steps {
            let step = run.workflow.step(id)?;
            if let Some(dep) = run.read(|exec| failed_dependency(exec, step)).await {
                debug!(execution_id = %run.id, step_id = %id, dependency = %dep, "Dependency failed");
                run.skip_step(id, "dependency_failed").await;
                continue;
            }

            match self.executor.execute(run, step, iteration).await {
                Ok(_) => {}
                Err(TesseraError::Cancelled) => return Err(TesseraError::Cancelled),
                Err(e) if strategy == FailureStrategy::Continue => {
                    debug!(execution_id = %run.id, step_id = %id, error = %e, "Failure tolerated");
                    run.tolerate(id).await;
                }
                Err(e) => return Err(e),
            }

            if let Some(cond) = continue_condition {
                let vars = run.variables().await;
                if run.workflow.condition(cond, &vars)? {
                    return Ok(SequenceEnd::ContinuedEarly);
                }
            }
        }
        Ok(SequenceEnd::Finished)
    }
}

/// First dependency of `step` that ended failed or cancelled.
pub(crate) fn failed_dependency(exec: &Execution, step: &WorkflowStep) -> Option<String> {
    step.dependencies
        .iter()
        .find(|d| {
            matches!(
                exec.context.step_status(d),
                StepStatus::Failed | StepStatus::Cancelled
            )
        })
        .cloned()
}
