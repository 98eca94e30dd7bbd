use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::task::{Id, JoinSet};
use tracing::{info, warn};

use tessera_core::error::{Result, TesseraError};
use tessera_core::types::ParallelGroupResult;
use tessera_core::workflow::FailureStrategy;

use super::FlowProcessor;
use crate::limiter::ConcurrencyLimiter;
use crate::run::ExecutionHandle;

type MemberOutcome = (String, Result<Value>, u64);

impl FlowProcessor {
    /// Run a parallel group under its concurrency cap.
    ///
    /// Members are launched in declaration order, each holding one limiter
    /// permit for its whole run (retries included). Under `fail_fast` the
    /// first failure stops further launches; members already running are
    /// still collected, members never launched are skipped, and the group
    /// fails. Under `continue` every member runs and failures are tolerated.
    /// `retry` resubmits a failed member up to `max_retries` times and then
    /// tolerates it like `continue`.
    pub(crate) async fn run_parallel(&self, run: &Arc<ExecutionHandle>, group_id: &str) -> Result<()> {
        let group = run.workflow.parallel_group(group_id)?;
        let limiter = ConcurrencyLimiter::new(group.max_concurrency);
        self.run_parallel_limited(run, group_id, &limiter).await
    }

    /// Every permit is back in `limiter` when this returns, whatever the outcome.
    pub(crate) async fn run_parallel_limited(
        &self,
        run: &Arc<ExecutionHandle>,
        group_id: &str,
        limiter: &ConcurrencyLimiter,
    ) -> Result<()> {
        let started = run
            .update(|exec| {
                if exec.context.parallel_results.contains_key(group_id) {
                    return false;
                }
                exec.context
                    .parallel_results
                    .insert(group_id.to_string(), ParallelGroupResult::new(group_id));
                true
            })
            .await;
        if !started {
            return Ok(());
        }

        let group = run.workflow.parallel_group(group_id)?;
        let strategy = group.failure_strategy;
        let resubmits = if strategy == FailureStrategy::Retry {
            group.max_retries
        } else {
            0
        };

        let mut pending = group.steps.iter();
        let mut next = pending.next();
        let mut tasks: JoinSet<MemberOutcome> = JoinSet::new();
        let mut launched: HashMap<Id, String> = HashMap::new();
        let mut halted = false;
        let mut failures: Vec<(String, String)> = Vec::new();

        loop {
            tokio::select! {
                biased;
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    let (step_id, outcome, elapsed_ms) = match joined {
                        Ok((task_id, done)) => {
                            launched.remove(&task_id);
                            done
                        }
                        Err(e) => {
                            let Some(step_id) = launched.remove(&e.id()) else {
                                warn!(execution_id = %run.id, group_id, error = %e, "Untracked parallel task died");
                                continue;
                            };
                            warn!(execution_id = %run.id, group_id, step_id = %step_id, error = %e, "Parallel member panicked");
                            let err = TesseraError::StepFailure {
                                step: step_id.clone(),
                                message: format!("member task died: {}", e),
                            };
                            run.fail_abandoned(&step_id, &err).await?;
                            (step_id, Err(err), 0)
                        }
                    };
                    let recorded = outcome.as_ref().map(Clone::clone).map_err(|e| e.to_string());
                    run.update(|exec| {
                        if let Some(result) = exec.context.parallel_results.get_mut(group_id) {
                            result.record(&step_id, recorded, elapsed_ms);
                        }
                    })
                    .await;

                    match outcome {
                        Ok(_) => {}
                        Err(TesseraError::Cancelled) => halted = true,
                        Err(e) if strategy != FailureStrategy::FailFast => {
                            run.tolerate(&step_id).await;
                            warn!(execution_id = %run.id, group_id, step_id = %step_id, error = %e, "Member failed, continuing");
                        }
                        Err(e) => {
                            warn!(execution_id = %run.id, group_id, step_id = %step_id, error = %e, "Member failed, halting group");
                            failures.push((step_id, e.to_string()));
                            halted = true;
                        }
                    }
                }
                permit = limiter.acquire(), if next.is_some() && !halted && !run.cancel.is_cancelled() => {
                    let permit = permit?;
                    // A finishing member frees its permit before its join result is visible.
                    if halted || run.cancel.is_cancelled() {
                        continue;
                    }
                    let Some(step_id) = next.take() else { continue };
                    next = pending.next();

                    let step = run.workflow.step(step_id)?.clone();
                    let executor = Arc::clone(self.executor());
                    let member = step.id.clone();
                    let run = Arc::clone(run);
                    let handle = tasks.spawn(async move {
                        let _permit = permit;
                        let start = Instant::now();
                        let mut outcome = executor.execute(&run, &step, None).await;
                        let mut attempt = 0;
                        while attempt < resubmits
                            && matches!(&outcome, Err(e) if !matches!(e, TesseraError::Cancelled))
                        {
                            attempt += 1;
                            warn!(execution_id = %run.id, step_id = %step.id, attempt, "Resubmitting failed member");
                            outcome = executor.execute(&run, &step, None).await;
                        }
                        (step.id.clone(), outcome, start.elapsed().as_millis() as u64)
                    });
                    launched.insert(handle.id(), member);
                }
                else => break,
            }
        }

        if run.cancel.is_cancelled() {
            return Err(TesseraError::Cancelled);
        }

        for step_id in next.into_iter().chain(pending) {
            run.skip_step(step_id, "group_halted").await;
        }

        let summary = run
            .read(|exec| exec.context.parallel_results.get(group_id).cloned())
            .await
            .unwrap_or_else(|| ParallelGroupResult::new(group_id));
        info!(
            execution_id = %run.id,
            group_id,
            completed = summary.completed_steps,
            failed = summary.failed_steps,
            average_ms = summary.average_step_ms,
            peak = limiter.peak(),
            "Parallel group finished"
        );

        if failures.is_empty() {
            return Ok(());
        }
        let failures = failures
            .iter()
            .map(|(step, message)| format!("{}: {}", step, message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(TesseraError::ConcurrencyGroupFailure {
            group: group_id.to_string(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use tessera_core::error::TesseraError;
    use tessera_core::types::StepStatus;
    use tessera_core::workflow::{FailureStrategy, ParallelGroup, WorkflowDefinition, WorkflowStep};
    use tessera_test_utils::ScriptedAgent;

    use crate::flow::test_support::{handle, processor};
    use crate::limiter::ConcurrencyLimiter;
    use crate::registry::AgentRegistry;

    fn definition(n: usize, group: ParallelGroup) -> WorkflowDefinition {
        (1..=n)
            .fold(WorkflowDefinition::new("w"), |d, i| {
                let id = format!("s{}", i);
                d.with_step(WorkflowStep::new(id.clone(), id))
            })
            .with_parallel_group(group)
    }

    fn members(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("s{}", i)).collect()
    }

    fn group(n: usize, cap: usize, strategy: FailureStrategy) -> ParallelGroup {
        let ids = members(n);
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        ParallelGroup::new("fan", &refs)
            .with_max_concurrency(cap)
            .with_strategy(strategy)
    }

    fn registry(agent: &ScriptedAgent) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        registry.register(agent.clone());
        registry.set_fallback("scripted");
        registry
    }

    #[tokio::test]
    async fn continue_counts_failures() {
        let agent = ScriptedAgent::new().with_default_delay(10).always_fail("s3");
        let run = handle(
            definition(5, group(5, 2, FailureStrategy::Continue)),
            HashMap::new(),
        );
        processor(registry(&agent)).run_parallel(&run, "fan").await.unwrap();

        let exec = run.snapshot().await;
        let result = &exec.context.parallel_results["fan"];
        assert_eq!(result.completed_steps, 4);
        assert_eq!(result.failed_steps, 1);
        assert!(result.errors.contains_key("s3"));
        assert_eq!(result.results.len(), 4);
        assert!(agent.peak_concurrency() <= 2);
        assert!(exec.context.tolerated_failures.contains("s3"));
    }

    #[tokio::test]
    async fn cap_holds_for_many_members() {
        let agent = ScriptedAgent::new().with_random_delay(1, 8);
        let run = handle(
            definition(30, group(30, 3, FailureStrategy::Continue)),
            HashMap::new(),
        );
        processor(registry(&agent)).run_parallel(&run, "fan").await.unwrap();
        assert!(agent.peak_concurrency() <= 3);
        assert_eq!(agent.calls().len(), 30);

        // Replay the transition log: never more than 3 running at once.
        let exec = run.snapshot().await;
        let mut running = 0i32;
        let mut peak = 0i32;
        for t in &exec.history {
            match t.status {
                StepStatus::Running => running += 1,
                StepStatus::Completed | StepStatus::Failed => running -= 1,
                _ => {}
            }
            peak = peak.max(running);
        }
        assert!(peak <= 3, "peak {peak}");
    }

    #[tokio::test]
    async fn fail_fast_halts_launches() {
        let agent = ScriptedAgent::new().with_default_delay(20).always_fail("s1");
        let run = handle(
            definition(6, group(6, 2, FailureStrategy::FailFast)),
            HashMap::new(),
        );
        let err = processor(registry(&agent))
            .run_parallel(&run, "fan")
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::ConcurrencyGroupFailure { ref group, .. } if group == "fan"));

        let exec = run.snapshot().await;
        // s1 and s2 were launched together; s2 is still collected.
        assert_eq!(exec.context.step_status("s2"), StepStatus::Completed);
        assert_eq!(exec.context.step_status("s6"), StepStatus::Skipped);
        assert!(agent.call_count("s6") == 0);
    }

    #[tokio::test]
    async fn retry_resubmits_before_counting() {
        let agent = ScriptedAgent::new().fail_times("s2", 1);
        let run = handle(
            definition(3, group(3, 3, FailureStrategy::Retry)),
            HashMap::new(),
        );
        processor(registry(&agent)).run_parallel(&run, "fan").await.unwrap();

        let exec = run.snapshot().await;
        assert_eq!(exec.context.parallel_results["fan"].failed_steps, 0);
        assert_eq!(exec.context.parallel_results["fan"].completed_steps, 3);
        assert_eq!(agent.call_count("s2"), 2);
    }

    #[tokio::test]
    async fn retry_exhausted_counts_and_continues() {
        let agent = ScriptedAgent::new().always_fail("s2");
        let run = handle(
            definition(4, group(4, 1, FailureStrategy::Retry)),
            HashMap::new(),
        );
        processor(registry(&agent)).run_parallel(&run, "fan").await.unwrap();

        // One initial run plus one resubmission.
        assert_eq!(agent.call_count("s2"), 2);
        let exec = run.snapshot().await;
        let result = &exec.context.parallel_results["fan"];
        assert_eq!(result.failed_steps, 1);
        assert_eq!(result.completed_steps, 3);
        // Launches kept going after the exhausted member.
        assert_eq!(agent.call_count("s4"), 1);
        assert_eq!(exec.context.step_status("s2"), StepStatus::Failed);
        assert!(exec.context.tolerated_failures.contains("s2"));
    }

    #[tokio::test]
    async fn panicking_member_fails_its_own_step() {
        let agent = ScriptedAgent::new().with_default_delay(5).panic_on("s2");
        let run = handle(
            definition(3, group(3, 3, FailureStrategy::Continue)),
            HashMap::new(),
        );
        processor(registry(&agent)).run_parallel(&run, "fan").await.unwrap();

        let exec = run.snapshot().await;
        let result = &exec.context.parallel_results["fan"];
        assert_eq!(result.failed_steps, 1);
        assert_eq!(result.completed_steps, 2);
        assert!(result.errors.contains_key("s2"));
        assert!(!result.errors.contains_key("<unknown>"));
        assert_eq!(exec.context.step_status("s2"), StepStatus::Failed);
        assert!(exec.context.tolerated_failures.contains("s2"));
    }

    #[tokio::test]
    async fn panicking_member_fails_fast_group() {
        let agent = ScriptedAgent::new().panic_on("s1");
        let run = handle(
            definition(3, group(3, 1, FailureStrategy::FailFast)),
            HashMap::new(),
        );
        let err = processor(registry(&agent))
            .run_parallel(&run, "fan")
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::ConcurrencyGroupFailure { ref failures, .. } if failures.starts_with("s1:")));
        let exec = run.snapshot().await;
        assert_eq!(exec.context.step_status("s1"), StepStatus::Failed);
        assert_eq!(exec.context.step_status("s3"), StepStatus::Skipped);
    }

    #[tokio::test]
    async fn cancel_mid_flight_returns_permits() {
        let agent = ScriptedAgent::new().with_default_delay(5_000);
        let run = handle(
            definition(6, group(6, 2, FailureStrategy::Continue)),
            HashMap::new(),
        );
        let limiter = ConcurrencyLimiter::new(2);
        let canceller = {
            let run = Arc::clone(&run);
            tokio::spawn(async move {
                for _ in 0..400 {
                    let running = run
                        .read(|e| {
                            e.context
                                .step_states
                                .values()
                                .filter(|s| **s == StepStatus::Running)
                                .count()
                        })
                        .await;
                    if running == 2 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                run.cancel.cancel();
            })
        };

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            processor(registry(&agent)).run_parallel_limited(&run, "fan", &limiter),
        )
        .await
        .expect("cancellation is prompt")
        .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, TesseraError::Cancelled));
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.available(), 2);
        let mut calls = agent.calls();
        calls.sort();
        assert_eq!(calls, vec!["s1", "s2"]);

        let exec = run.snapshot().await;
        assert_eq!(exec.context.step_status("s1"), StepStatus::Cancelled);
        assert_eq!(exec.context.step_status("s2"), StepStatus::Cancelled);
        for never in ["s3", "s4", "s5", "s6"] {
            assert_eq!(exec.context.step_status(never), StepStatus::Pending);
        }
    }
}
