use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tessera_core::error::{Result, TesseraError};
use tessera_core::event::EventBus;
use tessera_core::traits::Notifier;
use tessera_core::types::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, EngineEvent, ExecutionId, Notification,
};
use tessera_core::types::SYSTEM_APPROVER;
use tessera_core::workflow::ApprovalRule;

use crate::notify::dispatch;
use crate::run::{ExecutionHandle, Wake};

struct Entry {
    request: ApprovalRequest,
    rule: ApprovalRule,
    /// Dropped once the request is terminal or its execution finished.
    run: Option<Arc<ExecutionHandle>>,
    timer: CancellationToken,
}

/// Tracks approval requests across executions.
///
/// A pending request carries a deadline timer. When the deadline passes
/// with no decision, the next escalation tier (if any) is notified and gets
/// a fresh deadline; once the chain is exhausted the request resolves to
/// `timeout`, exactly once. Votes after any terminal status are refused.
///
/// Entries live only while their execution runs; the final copy of each
/// request stays in the execution context and the store.
pub struct ApprovalBroker {
    entries: Mutex<HashMap<String, Entry>>,
    event_bus: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
}

impl ApprovalBroker {
    pub fn new(event_bus: Arc<EventBus>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            event_bus,
            notifier,
        }
    }

    /// Open a request for `rule` in `run`.
    ///
    /// If the rule's auto-approval condition holds, the request is approved
    /// by the system approver on the spot and never becomes pending.
    pub async fn request(
        self: &Arc<Self>,
        run: &Arc<ExecutionHandle>,
        rule: &ApprovalRule,
    ) -> Result<ApprovalRequest> {
        let now = Utc::now();
        let mut request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: run.id.clone(),
            rule_id: rule.id.clone(),
            step_id: rule.step_id.clone(),
            approvers: rule.approvers.clone(),
            required_approvals: rule.required_approvals.max(1),
            votes: vec![],
            status: ApprovalStatus::Pending,
            deadline: now + chrono::Duration::milliseconds(rule.timeout_ms as i64),
            escalation_level: 0,
            created_at: now,
            resolved_at: None,
        };

        if let Some(cond) = &rule.auto_approval_condition {
            let vars = run.variables().await;
            if run.workflow.condition(cond, &vars)? {
                request.approve_as_system();
                info!(execution_id = %run.id, approval_id = %request.id, step_id = %rule.step_id, "Auto-approved");
                self.entries.lock().await.insert(
                    request.id.clone(),
                    Entry {
                        request: request.clone(),
                        rule: rule.clone(),
                        run: None,
                        timer: CancellationToken::new(),
                    },
                );
                record(run, &request).await;
                self.event_bus.publish(EngineEvent::ApprovalResolved {
                    approval_id: request.id.clone(),
                    status: request.status,
                });
                return Ok(request);
            }
        }

        let timer = run.timers.child_token();
        self.entries.lock().await.insert(
            request.id.clone(),
            Entry {
                request: request.clone(),
                rule: rule.clone(),
                run: Some(Arc::clone(run)),
                timer: timer.clone(),
            },
        );
        record(run, &request).await;

        info!(
            execution_id = %run.id,
            approval_id = %request.id,
            step_id = %rule.step_id,
            timeout_ms = rule.timeout_ms,
            "Approval requested"
        );
        self.event_bus.publish(EngineEvent::ApprovalRequested {
            request: request.clone(),
        });
        self.notify(run, rule, &request, &request.approvers);

        self.arm(request.id.clone(), Duration::from_millis(rule.timeout_ms), timer);
        Ok(request)
    }

    fn arm(self: &Arc<Self>, approval_id: String, first: Duration, timer: CancellationToken) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut wait = first;
            loop {
                tokio::select! {
                    _ = timer.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                match broker.on_deadline(&approval_id).await {
                    Some(next) => wait = next,
                    None => return,
                }
            }
        });
    }

    /// Escalate or time out. Returns the next wait when escalated.
    async fn on_deadline(&self, approval_id: &str) -> Option<Duration> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(approval_id)?;
        if entry.request.is_terminal() {
            return None;
        }
        let run = entry.run.clone()?;

        let level = entry.request.escalation_level as usize;
        if let Some(tier) = entry.rule.escalation_chain.get(level) {
            let wait = Duration::from_millis(tier.timeout_ms.unwrap_or(entry.rule.timeout_ms));
            entry.request.escalation_level += 1;
            for approver in &tier.approvers {
                if !entry.request.approvers.contains(approver) {
                    entry.request.approvers.push(approver.clone());
                }
            }
            entry.request.deadline =
                Utc::now() + chrono::Duration::milliseconds(wait.as_millis() as i64);

            warn!(
                execution_id = %run.id,
                approval_id,
                level = entry.request.escalation_level,
                "Approval escalated"
            );
            self.event_bus.publish(EngineEvent::ApprovalEscalated {
                approval_id: approval_id.to_string(),
                level: entry.request.escalation_level,
            });
            self.notify(&run, &entry.rule, &entry.request, &tier.approvers);
            let request = entry.request.clone();
            drop(entries);
            record(&run, &request).await;
            return Some(wait);
        }

        if !entry.request.resolve(ApprovalStatus::Timeout) {
            return None;
        }
        warn!(execution_id = %run.id, approval_id, "Approval timed out");
        let request = entry.request.clone();
        entry.run = None;
        drop(entries);
        self.finish(&run, &request).await;
        None
    }

    /// Record a vote. Returns the request's status after the vote.
    pub async fn submit(
        &self,
        approval_id: &str,
        approver: &str,
        decision: ApprovalDecision,
    ) -> Result<ApprovalStatus> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(approval_id)
            .ok_or_else(|| TesseraError::ApprovalNotFound(approval_id.to_string()))?;
        if approver == SYSTEM_APPROVER {
            return Err(TesseraError::NotAnApprover {
                approval: approval_id.to_string(),
                approver: approver.to_string(),
            });
        }

        let status = entry.request.record_vote(approver, decision)?;
        info!(approval_id, approver, decision = ?decision, status = %status, "Approval vote");

        let request = entry.request.clone();
        let run = if request.is_terminal() {
            entry.timer.cancel();
            entry.run.take()
        } else {
            entry.run.clone()
        };
        drop(entries);

        if let Some(run) = run {
            if request.is_terminal() {
                self.finish(&run, &request).await;
            } else {
                record(&run, &request).await;
            }
        }
        Ok(status)
    }

    async fn finish(&self, run: &ExecutionHandle, request: &ApprovalRequest) {
        record(run, request).await;
        self.event_bus.publish(EngineEvent::ApprovalResolved {
            approval_id: request.id.clone(),
            status: request.status,
        });
        run.wake(Wake::ApprovalResolved {
            approval_id: request.id.clone(),
        });
    }

    fn notify(
        &self,
        run: &ExecutionHandle,
        rule: &ApprovalRule,
        request: &ApprovalRequest,
        recipients: &[String],
    ) {
        dispatch(
            &self.notifier,
            Notification {
                recipients: recipients.to_vec(),
                template: rule.template.clone(),
                channel: rule.channel.clone(),
                priority: run.workflow.def.priority,
                data: serde_json::json!({
                    "approval_id": request.id,
                    "execution_id": request.execution_id,
                    "workflow_id": run.workflow.id(),
                    "step_id": request.step_id,
                    "deadline": request.deadline,
                    "escalation_level": request.escalation_level,
                }),
            },
        );
    }

    pub async fn get(&self, approval_id: &str) -> Option<ApprovalRequest> {
        self.entries
            .lock()
            .await
            .get(approval_id)
            .map(|e| e.request.clone())
    }

    /// List all pending approvals.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| !e.request.is_terminal())
            .map(|e| e.request.clone())
            .collect()
    }

    /// Number of requests currently tracked.
    pub async fn tracked(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Stop the timers of one execution's requests and forget them.
    pub async fn disarm_execution(&self, execution_id: &ExecutionId) {
        self.entries.lock().await.retain(|_, entry| {
            if &entry.request.execution_id != execution_id {
                return true;
            }
            entry.timer.cancel();
            false
        });
    }
}

/// Mirror the request into the execution context and the store.
async fn record(run: &ExecutionHandle, request: &ApprovalRequest) {
    run.update(|exec| {
        exec.context
            .approval_states
            .insert(request.rule_id.clone(), request.clone())
    })
    .await;
    if let Err(e) = run.store().save_approval(request).await {
        warn!(approval_id = %request.id, error = %e, "Failed to persist approval");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tessera_core::workflow::{WorkflowDefinition, WorkflowStep};
    use tessera_test_utils::RecordingNotifier;

    use crate::flow::test_support::handle;

    fn setup(
        rule: &ApprovalRule,
        vars: HashMap<String, serde_json::Value>,
    ) -> (Arc<ApprovalBroker>, Arc<ExecutionHandle>, RecordingNotifier) {
        let def = WorkflowDefinition::new("w")
            .with_step(WorkflowStep::new("send", "send"))
            .with_approval(rule.clone());
        let notifier = RecordingNotifier::new();
        let broker = Arc::new(ApprovalBroker::new(
            Arc::new(EventBus::default()),
            Arc::new(notifier.clone()),
        ));
        (broker, handle(def, vars), notifier)
    }

    #[tokio::test]
    async fn auto_approval_never_pends() {
        let rule = ApprovalRule::new("gate", "send")
            .with_approvers(&["lead"])
            .auto_approve_when("amount < 100");
        let (broker, run, notifier) = setup(
            &rule,
            HashMap::from([("amount".to_string(), serde_json::json!(20))]),
        );
        let mut events = broker.event_bus.subscribe();

        let req = broker.request(&run, &rule).await.unwrap();
        assert_eq!(req.status, ApprovalStatus::Approved);
        assert_eq!(req.votes.len(), 1);
        assert_eq!(req.votes[0].approver, SYSTEM_APPROVER);
        assert!(broker.pending_requests().await.is_empty());

        // The first event is the resolution; nothing was ever requested.
        match events.recv().await.unwrap() {
            EngineEvent::ApprovalResolved { status, .. } => {
                assert_eq!(status, ApprovalStatus::Approved)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        tokio::task::yield_now().await;
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn vote_resolves_and_closes() {
        let rule = ApprovalRule::new("gate", "send").with_approvers(&["lead", "ops"]);
        let (broker, run, notifier) = setup(&rule, HashMap::new());
        let req = broker.request(&run, &rule).await.unwrap();
        assert_eq!(req.status, ApprovalStatus::Pending);

        assert!(matches!(
            broker.submit(&req.id, "intruder", ApprovalDecision::Approve).await,
            Err(TesseraError::NotAnApprover { .. })
        ));
        assert_eq!(
            broker
                .submit(&req.id, "ops", ApprovalDecision::Approve)
                .await
                .unwrap(),
            ApprovalStatus::Approved
        );
        assert!(matches!(
            broker.submit(&req.id, "lead", ApprovalDecision::Reject).await,
            Err(TesseraError::ApprovalClosed(_))
        ));

        let exec = run.snapshot().await;
        assert_eq!(
            exec.context.approval_states["gate"].status,
            ApprovalStatus::Approved
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(notifier.sent().len(), 1);
        assert_eq!(notifier.sent()[0].recipients, vec!["lead", "ops"]);
    }

    #[tokio::test]
    async fn times_out_exactly_once() {
        let rule = ApprovalRule::new("gate", "send").with_timeout_ms(40);
        let (broker, run, _) = setup(&rule, HashMap::new());
        let mut events = broker.event_bus.subscribe();
        let req = broker.request(&run, &rule).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let resolved = broker.get(&req.id).await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Timeout);
        assert!(matches!(
            broker.submit(&req.id, "anyone", ApprovalDecision::Approve).await,
            Err(TesseraError::ApprovalClosed(_))
        ));

        let mut timeouts = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ApprovalResolved { status, .. } = event {
                assert_eq!(status, ApprovalStatus::Timeout);
                timeouts += 1;
            }
        }
        assert_eq!(timeouts, 1);
    }

    #[tokio::test]
    async fn escalation_gets_fresh_deadline() {
        let rule = ApprovalRule::new("gate", "send")
            .with_approvers(&["lead"])
            .with_timeout_ms(30)
            .escalate_to(&["director"], Some(200));
        let (broker, run, notifier) = setup(&rule, HashMap::new());
        let req = broker.request(&run, &rule).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let escalated = broker.get(&req.id).await.unwrap();
        assert_eq!(escalated.status, ApprovalStatus::Pending);
        assert_eq!(escalated.escalation_level, 1);
        assert!(escalated.approvers.contains(&"director".to_string()));

        // The escalated tier can decide.
        assert_eq!(
            broker
                .submit(&req.id, "director", ApprovalDecision::Approve)
                .await
                .unwrap(),
            ApprovalStatus::Approved
        );
        let recipients: Vec<Vec<String>> =
            notifier.sent().into_iter().map(|n| n.recipients).collect();
        assert_eq!(recipients, vec![vec!["lead".to_string()], vec!["director".to_string()]]);
    }

    #[tokio::test]
    async fn system_cannot_vote_from_outside() {
        let rule = ApprovalRule::new("gate", "send")
            .with_approvers(&["lead", "cfo"])
            .with_required_approvals(2);
        let (broker, run, _) = setup(&rule, HashMap::new());
        let req = broker.request(&run, &rule).await.unwrap();

        assert!(matches!(
            broker
                .submit(&req.id, SYSTEM_APPROVER, ApprovalDecision::Approve)
                .await,
            Err(TesseraError::NotAnApprover { .. })
        ));
        let current = broker.get(&req.id).await.unwrap();
        assert_eq!(current.status, ApprovalStatus::Pending);
        assert!(current.votes.is_empty());
        assert_eq!(
            run.snapshot().await.context.approval_states["gate"].status,
            ApprovalStatus::Pending
        );
    }

    #[tokio::test]
    async fn disarm_stops_timer_and_forgets() {
        let rule = ApprovalRule::new("gate", "send").with_timeout_ms(30);
        let (broker, run, _) = setup(&rule, HashMap::new());
        let req = broker.request(&run, &rule).await.unwrap();
        assert_eq!(broker.tracked().await, 1);

        broker.disarm_execution(&run.id).await;
        assert_eq!(broker.tracked().await, 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(broker.get(&req.id).await.is_none());
        assert!(matches!(
            broker.submit(&req.id, "x", ApprovalDecision::Approve).await,
            Err(TesseraError::ApprovalNotFound(_))
        ));
        assert!(broker.pending_requests().await.is_empty());

        // The timer never fired, so the recorded copy is still the pending one.
        assert_eq!(
            run.snapshot().await.context.approval_states["gate"].status,
            ApprovalStatus::Pending
        );
    }
}
