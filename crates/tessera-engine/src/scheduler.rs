use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tessera_core::error::{Result, TesseraError};
use tessera_core::event::EventBus;
use tessera_core::types::{EngineEvent, ExecutionId, ScheduledTask, TaskStatus};
use tessera_core::workflow::{ScheduleRule, ScheduleTrigger};

use crate::run::{ExecutionHandle, Wake};

/// Instant a timer trigger fires, or `None` for condition triggers.
pub fn next_fire(trigger: &ScheduleTrigger, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match trigger {
        ScheduleTrigger::Delay { delay_ms } => {
            Ok(Some(now + chrono::Duration::milliseconds(*delay_ms as i64)))
        }
        ScheduleTrigger::Time { at } => Ok(Some(*at)),
        ScheduleTrigger::Cron { expression } => {
            let schedule = Schedule::from_str(expression).map_err(|e| {
                TesseraError::Validation(format!("invalid cron `{}`: {}", expression, e))
            })?;
            schedule
                .after(&now)
                .next()
                .map(Some)
                .ok_or_else(|| {
                    TesseraError::Validation(format!("cron `{}` never fires", expression))
                })
        }
        ScheduleTrigger::Condition { .. } => Ok(None),
    }
}

/// Deferred step execution across executions.
///
/// Timer tasks (delay, time, cron) sleep until their instant, then wake the
/// owning execution. Condition tasks are evaluated by `poll_conditions`
/// whenever the execution re-examines its state. Either way a task moves
/// from `pending` to `executed` at most once.
pub struct TaskScheduler {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    event_bus: Arc<EventBus>,
}

impl TaskScheduler {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register a task for `rule` and arm its timer when it has one.
    pub async fn schedule(&self, run: &Arc<ExecutionHandle>, rule: &ScheduleRule) -> Result<ScheduledTask> {
        let now = Utc::now();
        let fire_at = next_fire(&rule.trigger, now)?;
        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: run.id.clone(),
            rule_id: rule.id.clone(),
            step_id: rule.step_id.clone(),
            trigger: rule.trigger.clone(),
            status: TaskStatus::Pending,
            fire_at,
            created_at: now,
        };
        self.tasks.lock().await.insert(task.id.clone(), task.clone());
        record(run, &task).await;

        info!(
            execution_id = %run.id,
            task_id = %task.id,
            step_id = %task.step_id,
            fire_at = ?fire_at,
            "Step scheduled"
        );

        if let Some(at) = fire_at {
            let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
            let timers = run.timers.clone();
            let run = Arc::clone(run);
            let task_id = task.id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timers.cancelled() => {
                        debug!(task_id = %task_id, "Scheduled task disarmed");
                    }
                    _ = tokio::time::sleep(wait) => {
                        run.wake(Wake::TaskFired { task_id });
                    }
                }
            });
        }
        Ok(task)
    }

    /// Move a pending task to `executed`. Returns false if it already left
    /// `pending`.
    pub async fn mark_fired(&self, run: &ExecutionHandle, task_id: &str) -> bool {
        let task = {
            let mut tasks = self.tasks.lock().await;
            let Some(task) = tasks.get_mut(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Pending || task.execution_id != run.id {
                return false;
            }
            task.status = TaskStatus::Executed;
            task.clone()
        };
        info!(execution_id = %run.id, task_id, step_id = %task.step_id, "Scheduled task fired");
        self.event_bus.publish(EngineEvent::ScheduledTaskFired {
            execution_id: run.id.clone(),
            task_id: task_id.to_string(),
            step_id: task.step_id.clone(),
        });
        record(run, &task).await;
        true
    }

    /// Evaluate this execution's pending condition tasks. Returns the ids of
    /// tasks that fired.
    pub async fn poll_conditions(&self, run: &ExecutionHandle) -> Vec<String> {
        let candidates: Vec<(String, String)> = self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| t.execution_id == run.id && t.status == TaskStatus::Pending)
            .filter_map(|t| match &t.trigger {
                ScheduleTrigger::Condition { expression, .. } => {
                    Some((t.id.clone(), expression.clone()))
                }
                _ => None,
            })
            .collect();
        if candidates.is_empty() {
            return vec![];
        }

        let vars = run.variables().await;
        let mut fired = Vec::new();
        for (task_id, expression) in candidates {
            match run.workflow.condition(&expression, &vars) {
                Ok(true) => {
                    if self.mark_fired(run, &task_id).await {
                        fired.push(task_id);
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(execution_id = %run.id, task_id = %task_id, error = %e, "Condition evaluation failed")
                }
            }
        }
        fired
    }

    /// Shortest poll interval among this execution's pending condition tasks.
    pub async fn poll_interval(&self, execution_id: &ExecutionId, default: Duration) -> Option<Duration> {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| &t.execution_id == execution_id && t.status == TaskStatus::Pending)
            .filter_map(|t| match &t.trigger {
                ScheduleTrigger::Condition { poll_interval_ms, .. } => Some(
                    poll_interval_ms
                        .map(|ms| Duration::from_millis(ms.max(1)))
                        .unwrap_or(default),
                ),
                _ => None,
            })
            .min()
    }

    pub async fn get(&self, task_id: &str) -> Option<ScheduledTask> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Number of tasks currently tracked.
    pub async fn tracked(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Cancel every pending task of one execution and forget all of its
    /// tasks. Final copies stay in the execution context.
    pub async fn disarm_execution(&self, run: &ExecutionHandle) {
        let mut cancelled = Vec::new();
        self.tasks.lock().await.retain(|_, task| {
            if task.execution_id != run.id {
                return true;
            }
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Cancelled;
                cancelled.push(task.clone());
            }
            false
        });
        for task in &cancelled {
            record(run, task).await;
        }
    }
}

async fn record(run: &ExecutionHandle, task: &ScheduledTask) {
    run.update(|exec| {
        exec.context
            .scheduled_tasks
            .insert(task.rule_id.clone(), task.clone())
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chrono::Timelike;
    use tessera_core::workflow::{WorkflowDefinition, WorkflowStep};

    use crate::flow::test_support::handle;

    fn setup(rule: &ScheduleRule, vars: HashMap<String, serde_json::Value>) -> (TaskScheduler, Arc<ExecutionHandle>) {
        let def = WorkflowDefinition::new("w")
            .with_step(WorkflowStep::new("send", "send"))
            .with_schedule(rule.clone());
        (TaskScheduler::new(Arc::new(EventBus::default())), handle(def, vars))
    }

    #[test]
    fn cron_next_fire_is_real() {
        let now = Utc::now();
        let at = next_fire(
            &ScheduleTrigger::Cron {
                expression: "0 30 9 * * * *".into(),
            },
            now,
        )
        .unwrap()
        .unwrap();
        assert!(at > now);
        assert_eq!((at.hour(), at.minute(), at.second()), (9, 30, 0));
        assert!(at - now <= chrono::Duration::days(1));
    }

    #[test]
    fn delay_and_time() {
        let now = Utc::now();
        let at = next_fire(&ScheduleTrigger::Delay { delay_ms: 1500 }, now)
            .unwrap()
            .unwrap();
        assert_eq!((at - now).num_milliseconds(), 1500);

        let fixed = now + chrono::Duration::hours(2);
        assert_eq!(
            next_fire(&ScheduleTrigger::Time { at: fixed }, now).unwrap(),
            Some(fixed)
        );
        assert_eq!(
            next_fire(
                &ScheduleTrigger::Condition {
                    expression: "true".into(),
                    poll_interval_ms: None
                },
                now
            )
            .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn delay_task_wakes_execution() {
        let rule = ScheduleRule::new("later", "send", ScheduleTrigger::Delay { delay_ms: 20 });
        let def = WorkflowDefinition::new("w")
            .with_step(WorkflowStep::new("send", "send"))
            .with_schedule(rule.clone());
        let compiled = Arc::new(crate::compile::CompiledWorkflow::compile(def).unwrap());
        let exec = tessera_core::types::Execution::new("w", Default::default());
        let (run, mut wake_rx) = ExecutionHandle::new(
            compiled,
            exec,
            Arc::new(EventBus::default()),
            Arc::new(tessera_store::MemoryStore::new()),
            Arc::new(crate::metrics::MetricsRecorder::default()),
        );
        let scheduler = TaskScheduler::new(Arc::new(EventBus::default()));
        let task = scheduler.schedule(&run, &rule).await.unwrap();

        let woke = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(Wake::TaskFired { task_id }) = wake_rx.recv().await {
                    return task_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(woke, task.id);
        assert!(scheduler.mark_fired(&run, &task.id).await);
        assert!(!scheduler.mark_fired(&run, &task.id).await);
        assert_eq!(
            scheduler.get(&task.id).await.unwrap().status,
            TaskStatus::Executed
        );
    }

    #[tokio::test]
    async fn condition_fires_once_when_true() {
        let rule = ScheduleRule::new(
            "when-ready",
            "send",
            ScheduleTrigger::Condition {
                expression: "ready == true".into(),
                poll_interval_ms: Some(10),
            },
        );
        let (scheduler, run) = setup(&rule, HashMap::new());
        let task = scheduler.schedule(&run, &rule).await.unwrap();
        assert!(task.fire_at.is_none());
        assert_eq!(
            scheduler.poll_interval(&run.id, Duration::from_secs(1)).await,
            Some(Duration::from_millis(10))
        );

        assert!(scheduler.poll_conditions(&run).await.is_empty());
        run.merge_variables(HashMap::from([("ready".to_string(), serde_json::json!(true))]))
            .await;
        assert_eq!(scheduler.poll_conditions(&run).await, vec![task.id.clone()]);
        assert!(scheduler.poll_conditions(&run).await.is_empty());
        assert_eq!(scheduler.poll_interval(&run.id, Duration::from_secs(1)).await, None);
    }

    #[tokio::test]
    async fn disarm_cancels_pending() {
        let rule = ScheduleRule::new("later", "send", ScheduleTrigger::Delay { delay_ms: 10_000 });
        let (scheduler, run) = setup(&rule, HashMap::new());
        let task = scheduler.schedule(&run, &rule).await.unwrap();
        run.timers.cancel();
        scheduler.disarm_execution(&run).await;
        assert!(scheduler.get(&task.id).await.is_none());
        assert_eq!(scheduler.tracked().await, 0);
        assert!(!scheduler.mark_fired(&run, &task.id).await);
        let exec = run.snapshot().await;
        assert_eq!(exec.context.scheduled_tasks["later"].status, TaskStatus::Cancelled);
    }
}
