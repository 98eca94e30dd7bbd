use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use tessera_core::error::Result;
use tessera_core::types::{LoopExitReason, LoopResult};

use super::FlowProcessor;
use crate::run::ExecutionHandle;

impl FlowProcessor {
    /// Run a bounded loop.
    ///
    /// An iteration starts only while the counter is below `max_iterations`
    /// and `condition` (if any) holds. The iteration variable is bound to the
    /// zero-based index. After the steps run, a true `break_condition` ends
    /// the loop. Members that never ran are skipped once the loop exits.
    pub(crate) async fn run_loop(&self, run: &Arc<ExecutionHandle>, loop_id: &str) -> Result<()> {
        if run
            .read(|exec| exec.context.loop_results.contains_key(loop_id))
            .await
        {
            return Ok(());
        }

        let lp = run.workflow.loop_def(loop_id)?;
        let mut counter = run
            .read(|exec| exec.context.loop_counters.get(loop_id).copied().unwrap_or(0))
            .await;

        let outcome: Result<LoopExitReason> = loop {
            if counter >= lp.max_iterations {
                break Ok(LoopExitReason::MaxIterations);
            }
            if let Some(cond) = &lp.condition {
                let vars = run.variables().await;
                match run.workflow.condition(cond, &vars) {
                    Ok(true) => {}
                    Ok(false) => break Ok(LoopExitReason::ConditionFalse),
                    Err(e) => break Err(e),
                }
            }

            let index = counter;
            counter += 1;
            run.update(|exec| {
                exec.context
                    .loop_counters
                    .insert(loop_id.to_string(), counter);
                if let Some(var) = &lp.iteration_variable {
                    exec.context
                        .variables
                        .insert(var.clone(), Value::from(index));
                }
            })
            .await;

            if let Err(e) = self
                .run_sequence(
                    run,
                    &lp.steps,
                    lp.failure_strategy,
                    Some(index),
                    lp.continue_condition.as_deref(),
                )
                .await
            {
                break Err(e);
            }

            if let Some(cond) = &lp.break_condition {
                let vars = run.variables().await;
                match run.workflow.condition(cond, &vars) {
                    Ok(true) => break Ok(LoopExitReason::Condition),
                    Ok(false) => {}
                    Err(e) => break Err(e),
                }
            }
        };

        let break_reason = match &outcome {
            Ok(reason) => *reason,
            Err(e) => {
                warn!(execution_id = %run.id, loop_id, error = %e, "Loop aborted");
                LoopExitReason::Error
            }
        };
        info!(
            execution_id = %run.id,
            loop_id,
            iterations = counter,
            reason = ?break_reason,
            "Loop finished"
        );
        run.update(|exec| {
            exec.context.loop_results.insert(
                loop_id.to_string(),
                LoopResult {
                    loop_id: loop_id.to_string(),
                    iterations: counter,
                    break_reason,
                },
            );
        })
        .await;

        for member in &lp.steps {
            run.skip_step(member, "loop_not_entered").await;
        }

        outcome.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tessera_core::error::TesseraError;
    use tessera_core::types::{LoopExitReason, StepStatus};
    use tessera_core::workflow::{FailureStrategy, LoopDefinition, WorkflowDefinition, WorkflowStep};
    use tessera_test_utils::ScriptedAgent;

    use crate::flow::test_support::{handle, processor};
    use crate::registry::AgentRegistry;

    fn definition(lp: LoopDefinition) -> WorkflowDefinition {
        WorkflowDefinition::new("w")
            .with_step(WorkflowStep::new("poll", "poll"))
            .with_step(WorkflowStep::new("record", "record").depends_on(&["poll"]))
            .with_loop(lp)
    }

    fn registry(agent: &ScriptedAgent) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        registry.register(agent.clone());
        registry.set_fallback("scripted");
        registry
    }

    #[tokio::test]
    async fn always_true_runs_exactly_max() {
        let lp = LoopDefinition::new("retry", &["poll", "record"])
            .with_condition("true")
            .with_max_iterations(4);
        let agent = ScriptedAgent::new();
        let run = handle(definition(lp), HashMap::new());
        processor(registry(&agent)).run_loop(&run, "retry").await.unwrap();

        let exec = run.snapshot().await;
        let result = &exec.context.loop_results["retry"];
        assert_eq!(result.iterations, 4);
        assert_eq!(result.break_reason, LoopExitReason::MaxIterations);
        assert_eq!(agent.call_count("poll"), 4);
        assert_eq!(agent.call_count("record"), 4);

        let iterations: Vec<Option<u32>> = exec
            .steps
            .iter()
            .filter(|s| s.step_id == "poll")
            .map(|s| s.iteration)
            .collect();
        assert_eq!(iterations, vec![Some(0), Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn break_condition_stops() {
        let lp = LoopDefinition::new("retry", &["poll", "record"])
            .with_iteration_variable("i")
            .with_max_iterations(10)
            .break_when("i >= 2");
        let agent = ScriptedAgent::new();
        let run = handle(definition(lp), HashMap::new());
        processor(registry(&agent)).run_loop(&run, "retry").await.unwrap();

        let exec = run.snapshot().await;
        let result = &exec.context.loop_results["retry"];
        assert_eq!(result.iterations, 3);
        assert_eq!(result.break_reason, LoopExitReason::Condition);
        assert_eq!(exec.context.loop_counters["retry"], 3);
    }

    #[tokio::test]
    async fn false_condition_never_enters() {
        let lp = LoopDefinition::new("retry", &["poll", "record"]).with_condition("pending > 0");
        let agent = ScriptedAgent::new();
        let run = handle(
            definition(lp),
            HashMap::from([("pending".to_string(), serde_json::json!(0))]),
        );
        processor(registry(&agent)).run_loop(&run, "retry").await.unwrap();

        let exec = run.snapshot().await;
        assert_eq!(exec.context.loop_results["retry"].iterations, 0);
        assert_eq!(
            exec.context.loop_results["retry"].break_reason,
            LoopExitReason::ConditionFalse
        );
        assert_eq!(exec.context.step_status("poll"), StepStatus::Skipped);
        assert!(agent.calls().is_empty());
    }

    #[tokio::test]
    async fn continue_condition_short_circuits_iteration() {
        let lp = LoopDefinition::new("retry", &["poll", "record"])
            .with_max_iterations(2)
            .continue_when("true");
        let agent = ScriptedAgent::new();
        let run = handle(definition(lp), HashMap::new());
        processor(registry(&agent)).run_loop(&run, "retry").await.unwrap();

        assert_eq!(agent.call_count("poll"), 2);
        assert_eq!(agent.call_count("record"), 0);
        let exec = run.snapshot().await;
        assert_eq!(exec.context.step_status("record"), StepStatus::Skipped);
    }

    #[tokio::test]
    async fn failure_records_error_and_propagates() {
        let lp = LoopDefinition::new("retry", &["poll", "record"]).with_max_iterations(5);
        let agent = ScriptedAgent::new().always_fail("record");
        let run = handle(definition(lp), HashMap::new());
        let err = processor(registry(&agent))
            .run_loop(&run, "retry")
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::StepFailure { .. }));

        let exec = run.snapshot().await;
        assert_eq!(exec.context.loop_results["retry"].break_reason, LoopExitReason::Error);
        assert_eq!(exec.context.loop_results["retry"].iterations, 1);
    }

    #[tokio::test]
    async fn continue_strategy_keeps_looping() {
        let lp = LoopDefinition::new("retry", &["poll", "record"])
            .with_max_iterations(3)
            .with_strategy(FailureStrategy::Continue);
        let agent = ScriptedAgent::new().always_fail("poll");
        let run = handle(definition(lp), HashMap::new());
        processor(registry(&agent)).run_loop(&run, "retry").await.unwrap();

        let exec = run.snapshot().await;
        assert_eq!(exec.context.loop_results["retry"].iterations, 3);
        assert!(exec.context.tolerated_failures.contains("poll"));
        // `record` depends on the failed `poll` and never runs.
        assert_eq!(agent.call_count("record"), 0);
    }

    #[tokio::test]
    async fn reentry_is_noop() {
        let lp = LoopDefinition::new("retry", &["poll"]).with_max_iterations(2);
        let def = WorkflowDefinition::new("w")
            .with_step(WorkflowStep::new("poll", "poll"))
            .with_loop(lp);
        let agent = ScriptedAgent::new();
        let run = handle(def, HashMap::new());
        let p = processor(registry(&agent));
        p.run_loop(&run, "retry").await.unwrap();
        p.run_loop(&run, "retry").await.unwrap();
        assert_eq!(agent.call_count("poll"), 2);
    }
}
