use std::sync::atomic::{AtomicU64, Ordering};

use tessera_core::types::{ExecutionStatus, OrchestrationMetrics};

/// Process-wide counters behind `Engine::get_metrics`.
#[derive(Default)]
pub struct MetricsRecorder {
    workflows: AtomicU64,
    executions: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    steps: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    finished_duration_ms: AtomicU64,
}

impl MetricsRecorder {
    pub fn workflow_created(&self) {
        self.workflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_started(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_finished(&self, status: ExecutionStatus, duration_ms: u64) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.finished_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        let counter = match status {
            ExecutionStatus::Completed => &self.completed,
            ExecutionStatus::Cancelled => &self.cancelled,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn step_started(&self) {
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn step_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn step_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OrchestrationMetrics {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let cancelled = self.cancelled.load(Ordering::Relaxed);
        let finished = completed + failed + cancelled;
        let average_execution_ms = if finished == 0 {
            0.0
        } else {
            self.finished_duration_ms.load(Ordering::Relaxed) as f64 / finished as f64
        };
        OrchestrationMetrics {
            total_workflows: self.workflows.load(Ordering::Relaxed),
            total_executions: self.executions.load(Ordering::Relaxed),
            active_executions: self.active.load(Ordering::Relaxed),
            completed_executions: completed,
            failed_executions: failed,
            cancelled_executions: cancelled,
            total_steps_executed: self.steps.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            retry_count: self.retries.load(Ordering::Relaxed),
            average_execution_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_average() {
        let m = MetricsRecorder::default();
        m.workflow_created();
        m.execution_started();
        m.execution_started();
        m.step_started();
        m.step_error();
        m.step_retry();
        m.execution_finished(ExecutionStatus::Completed, 100);
        m.execution_finished(ExecutionStatus::Failed, 300);

        let snap = m.snapshot();
        assert_eq!(snap.total_workflows, 1);
        assert_eq!(snap.total_executions, 2);
        assert_eq!(snap.active_executions, 0);
        assert_eq!(snap.completed_executions, 1);
        assert_eq!(snap.failed_executions, 1);
        assert_eq!(snap.total_steps_executed, 1);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.retry_count, 1);
        assert!((snap.average_execution_ms - 200.0).abs() < f64::EPSILON);
    }
}
