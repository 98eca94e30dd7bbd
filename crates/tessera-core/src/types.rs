use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TesseraError};
use crate::workflow::{Priority, ScheduleTrigger};

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Dependents may start once a dependency reaches one of these.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Status only moves forward; `failed -> running` is the retry edge.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        match (self, next) {
            (Pending, Running | Skipped | Cancelled) => true,
            (Running, Completed | Failed | Cancelled) => true,
            (Failed, Running) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Runtime record of one step attempt sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: String,
    pub step_id: String,
    #[serde(default)]
    pub agent: Option<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    /// Loop iteration this record belongs to.
    #[serde(default)]
    pub iteration: Option<u32>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepExecution {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            step_id: step_id.into(),
            agent: None,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            iteration: None,
            result: None,
            error: None,
        }
    }

    /// Apply a status change, rejecting backward moves.
    pub fn transition(&mut self, next: StepStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TesseraError::Validation(format!(
                "step {} cannot move from {} to {}",
                self.step_id, self.status, next
            )));
        }
        let now = Utc::now();
        match next {
            StepStatus::Running => {
                if self.status == StepStatus::Failed {
                    self.retry_count += 1;
                    self.error = None;
                }
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// One entry of an execution's step transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTransition {
    pub step_id: String,
    pub record_id: String,
    pub status: StepStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExitReason {
    /// `break_condition` evaluated true.
    Condition,
    MaxIterations,
    Error,
    /// The loop's own `condition` evaluated false.
    ConditionFalse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopResult {
    pub loop_id: String,
    pub iterations: u32,
    pub break_reason: LoopExitReason,
}

/// Aggregate outcome of a parallel group, keyed by step id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelGroupResult {
    pub group_id: String,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub average_step_ms: f64,
    pub results: BTreeMap<String, serde_json::Value>,
    pub errors: BTreeMap<String, String>,
}

impl ParallelGroupResult {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            ..Default::default()
        }
    }

    /// Fold one finished member into the counters and running average.
    pub fn record(&mut self, step_id: &str, outcome: std::result::Result<serde_json::Value, String>, elapsed_ms: u64) {
        match outcome {
            Ok(value) => {
                self.completed_steps += 1;
                self.results.insert(step_id.to_string(), value);
            }
            Err(e) => {
                self.failed_steps += 1;
                self.errors.insert(step_id.to_string(), e);
            }
        }
        let n = (self.completed_steps + self.failed_steps) as f64;
        self.average_step_ms += (elapsed_ms as f64 - self.average_step_ms) / n;
    }
}

/// Per-execution mutable state. Only the owning coordinator writes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub variables: HashMap<String, serde_json::Value>,
    pub loop_counters: HashMap<String, u32>,
    pub loop_results: HashMap<String, LoopResult>,
    /// `<branch id>:<path>` entries, append-only.
    pub branch_history: Vec<String>,
    pub parallel_results: HashMap<String, ParallelGroupResult>,
    pub approval_states: HashMap<String, ApprovalRequest>,
    pub scheduled_tasks: HashMap<String, ScheduledTask>,
    /// Latest status per step id.
    pub step_states: HashMap<String, StepStatus>,
    /// Failed steps whose owning construct declared `continue`.
    pub tolerated_failures: HashSet<String>,
}

impl ExecutionContext {
    pub fn new(variables: HashMap<String, serde_json::Value>) -> Self {
        Self {
            variables,
            ..Default::default()
        }
    }

    pub fn branch_taken(&self, branch_id: &str) -> Option<&str> {
        let prefix = format!("{}:", branch_id);
        self.branch_history
            .iter()
            .find_map(|entry| entry.strip_prefix(prefix.as_str()))
    }

    pub fn step_status(&self, step_id: &str) -> StepStatus {
        self.step_states
            .get(step_id)
            .copied()
            .unwrap_or(StepStatus::Pending)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_steps_executed: u64,
    pub error_count: u64,
    pub retry_count: u64,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub step_id: Option<String>,
}

impl ExecutionError {
    pub fn from_error(err: &TesseraError, step_id: Option<String>) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            step_id,
        }
    }
}

/// One run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub context: ExecutionContext,
    pub steps: Vec<StepExecution>,
    pub history: Vec<StepTransition>,
    pub metrics: ExecutionMetrics,
    #[serde(default)]
    pub error: Option<ExecutionError>,
}

impl Execution {
    pub fn new(workflow_id: impl Into<String>, context: ExecutionContext) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            started_at: None,
            ended_at: None,
            context,
            steps: vec![],
            history: vec![],
            metrics: ExecutionMetrics::default(),
            error: None,
        }
    }

    /// Most recent record for a step id.
    pub fn latest_step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().rev().find(|s| s.step_id == step_id)
    }

    pub fn step_record_mut(&mut self, record_id: &str) -> Option<&mut StepExecution> {
        self.steps.iter_mut().find(|s| s.id == record_id)
    }

    /// Append a transition to the log and mirror it into `step_states`.
    pub fn log_transition(&mut self, step_id: &str, record_id: &str, status: StepStatus) {
        self.history.push(StepTransition {
            step_id: step_id.to_string(),
            record_id: record_id.to_string(),
            status,
            at: Utc::now(),
        });
        self.context.step_states.insert(step_id.to_string(), status);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl std::str::FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" | "approved" | "yes" => Ok(Self::Approve),
            "reject" | "rejected" | "no" => Ok(Self::Reject),
            other => Err(format!("unknown approval decision: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalVote {
    pub approver: String,
    pub decision: ApprovalDecision,
    pub timestamp: DateTime<Utc>,
}

/// Synthetic approver used for auto-approvals.
pub const SYSTEM_APPROVER: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub execution_id: ExecutionId,
    pub rule_id: String,
    pub step_id: String,
    /// Approvers currently allowed to vote. Empty means anyone.
    pub approvers: Vec<String>,
    pub required_approvals: u32,
    pub votes: Vec<ApprovalVote>,
    pub status: ApprovalStatus,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub escalation_level: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn is_terminal(&self) -> bool {
        self.status != ApprovalStatus::Pending
    }

    /// Record a vote and return the (possibly new) status.
    ///
    /// Any rejection is terminal. Approval needs `required_approvals`
    /// distinct approvers.
    pub fn record_vote(&mut self, approver: &str, decision: ApprovalDecision) -> Result<ApprovalStatus> {
        if self.is_terminal() {
            return Err(TesseraError::ApprovalClosed(self.id.clone()));
        }
        if approver == SYSTEM_APPROVER
            || (!self.approvers.is_empty() && !self.approvers.iter().any(|a| a == approver))
        {
            return Err(TesseraError::NotAnApprover {
                approval: self.id.clone(),
                approver: approver.to_string(),
            });
        }

        self.votes.retain(|v| v.approver != approver);
        self.votes.push(ApprovalVote {
            approver: approver.to_string(),
            decision,
            timestamp: Utc::now(),
        });

        let approvals = self
            .votes
            .iter()
            .filter(|v| v.decision == ApprovalDecision::Approve)
            .count() as u32;

        if decision == ApprovalDecision::Reject {
            self.resolve(ApprovalStatus::Rejected);
        } else if approvals >= self.required_approvals.max(1) {
            self.resolve(ApprovalStatus::Approved);
        }
        Ok(self.status)
    }

    /// Approve on behalf of the system approver, regardless of
    /// `required_approvals`. Only auto-approval goes through here.
    pub fn approve_as_system(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.votes.push(ApprovalVote {
            approver: SYSTEM_APPROVER.to_string(),
            decision: ApprovalDecision::Approve,
            timestamp: Utc::now(),
        });
        self.resolve(ApprovalStatus::Approved)
    }

    /// Move to a terminal status. Returns false if already terminal.
    pub fn resolve(&mut self, status: ApprovalStatus) -> bool {
        if self.is_terminal() || status == ApprovalStatus::Pending {
            return false;
        }
        self.status = status;
        self.resolved_at = Some(Utc::now());
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Executed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub execution_id: ExecutionId,
    pub rule_id: String,
    pub step_id: String,
    pub trigger: ScheduleTrigger,
    pub status: TaskStatus,
    /// Computed instant for timer triggers; `None` for condition triggers.
    #[serde(default)]
    pub fire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Process-wide counters exposed by `getMetrics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationMetrics {
    pub total_workflows: u64,
    pub total_executions: u64,
    pub active_executions: u64,
    pub completed_executions: u64,
    pub failed_executions: u64,
    pub cancelled_executions: u64,
    pub total_steps_executed: u64,
    pub error_count: u64,
    pub retry_count: u64,
    pub average_execution_ms: f64,
}

/// Fire-and-forget notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub template: String,
    pub channel: String,
    pub priority: Priority,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Events published on the engine's bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    WorkflowCreated {
        workflow_id: String,
    },
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: String,
    },
    StepStarted {
        execution_id: ExecutionId,
        step_id: String,
        attempt: u32,
    },
    StepCompleted {
        execution_id: ExecutionId,
        step_id: String,
        elapsed_ms: u64,
    },
    StepFailed {
        execution_id: ExecutionId,
        step_id: String,
        error: String,
    },
    StepSkipped {
        execution_id: ExecutionId,
        step_id: String,
        reason: String,
    },
    ApprovalRequested {
        request: ApprovalRequest,
    },
    ApprovalEscalated {
        approval_id: String,
        level: u32,
    },
    ApprovalResolved {
        approval_id: String,
        status: ApprovalStatus,
    },
    ScheduledTaskFired {
        execution_id: ExecutionId,
        task_id: String,
        step_id: String,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_request(approvers: &[&str], required: u32) -> ApprovalRequest {
        ApprovalRequest {
            id: "ap-1".into(),
            execution_id: ExecutionId::from_string("ex-1"),
            rule_id: "rule".into(),
            step_id: "send".into(),
            approvers: approvers.iter().map(|a| a.to_string()).collect(),
            required_approvals: required,
            votes: vec![],
            status: ApprovalStatus::Pending,
            deadline: Utc::now(),
            escalation_level: 0,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_step_status_monotonic() {
        use StepStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Skipped.can_transition_to(Running));
    }

    #[test]
    fn test_step_retry_counts() {
        let mut rec = StepExecution::new("a");
        rec.transition(StepStatus::Running).unwrap();
        rec.transition(StepStatus::Failed).unwrap();
        rec.transition(StepStatus::Running).unwrap();
        assert_eq!(rec.retry_count, 1);
        rec.transition(StepStatus::Completed).unwrap();
        assert!(rec.transition(StepStatus::Pending).is_err());
        assert!(rec.duration_ms().is_some());
    }

    #[test]
    fn test_vote_requires_quorum() {
        let mut req = pending_request(&["alice", "bob"], 2);
        assert_eq!(
            req.record_vote("alice", ApprovalDecision::Approve).unwrap(),
            ApprovalStatus::Pending
        );
        // Duplicate vote from the same approver does not count twice.
        assert_eq!(
            req.record_vote("alice", ApprovalDecision::Approve).unwrap(),
            ApprovalStatus::Pending
        );
        assert_eq!(
            req.record_vote("bob", ApprovalDecision::Approve).unwrap(),
            ApprovalStatus::Approved
        );
    }

    #[test]
    fn test_vote_after_terminal_rejected() {
        let mut req = pending_request(&[], 1);
        assert_eq!(
            req.record_vote("carol", ApprovalDecision::Reject).unwrap(),
            ApprovalStatus::Rejected
        );
        assert!(matches!(
            req.record_vote("carol", ApprovalDecision::Approve),
            Err(TesseraError::ApprovalClosed(_))
        ));
    }

    #[test]
    fn test_vote_from_stranger() {
        let mut req = pending_request(&["alice"], 1);
        assert!(matches!(
            req.record_vote("mallory", ApprovalDecision::Approve),
            Err(TesseraError::NotAnApprover { .. })
        ));
    }

    #[test]
    fn test_system_voter_is_internal_only() {
        let mut req = pending_request(&[], 2);
        assert!(matches!(
            req.record_vote(SYSTEM_APPROVER, ApprovalDecision::Approve),
            Err(TesseraError::NotAnApprover { .. })
        ));
        assert!(req.votes.is_empty());
        assert_eq!(req.status, ApprovalStatus::Pending);

        assert!(req.approve_as_system());
        assert_eq!(req.status, ApprovalStatus::Approved);
        assert!(!req.approve_as_system());
    }

    #[test]
    fn test_resolve_once() {
        let mut req = pending_request(&[], 1);
        assert!(req.resolve(ApprovalStatus::Timeout));
        assert!(!req.resolve(ApprovalStatus::Timeout));
        assert!(!req.resolve(ApprovalStatus::Approved));
        assert_eq!(req.status, ApprovalStatus::Timeout);
    }

    #[test]
    fn test_group_running_average() {
        let mut g = ParallelGroupResult::new("g");
        g.record("a", Ok(serde_json::json!(1)), 10);
        g.record("b", Err("boom".into()), 30);
        assert_eq!(g.completed_steps, 1);
        assert_eq!(g.failed_steps, 1);
        assert!((g.average_step_ms - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_branch_taken_lookup() {
        let mut ctx = ExecutionContext::default();
        ctx.branch_history.push("route:else_if:0".into());
        assert_eq!(ctx.branch_taken("route"), Some("else_if:0"));
        assert_eq!(ctx.branch_taken("other"), None);
    }
}
