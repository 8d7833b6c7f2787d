//! Approval instances: one run of a workflow version against a record
//!
//! The transition methods here validate and apply a single state change
//! in memory. Authorization and persistence are the engine's concern; the
//! engine applies these methods to a copy and commits it with a
//! compare-and-swap.

use crate::{
    ApprovalError, ApprovalResult, ApprovalWorkflow, AuditAction, AuditEntry, AuditEntryId,
    InstanceId, RecordRef, WorkflowId,
};
use chrono::{DateTime, Duration, Utc};
use rbac_types::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Approval Instance ────────────────────────────────────────────────

/// A running or finished approval
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub id: InstanceId,
    pub workflow_id: WorkflowId,
    /// Version pinned at start
    pub workflow_version: u32,
    pub record: RecordRef,
    /// 1-based; never decreases
    pub current_step: u32,
    pub status: InstanceStatus,
    pub requested_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub audit_trail: Vec<AuditEntry>,
    pub escalation_count: u32,
    /// Storage CAS token, bumped on every committed change
    pub revision: u64,
    /// One record per workflow step, in step order
    pub steps: Vec<StepExecutionRecord>,
}

impl ApprovalInstance {
    /// New instance at step 1, all records pending, step 1 opened
    pub fn new(
        workflow: &ApprovalWorkflow,
        record: RecordRef,
        requested_by: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        let steps = workflow
            .steps
            .iter()
            .map(|s| StepExecutionRecord::pending(s.order))
            .map(|mut r| {
                if r.step_order == 1 {
                    r.opened_at = Some(now);
                }
                r
            })
            .collect();
        Self {
            id: InstanceId::generate(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            record,
            current_step: 1,
            status: InstanceStatus::Pending,
            requested_by,
            created_at: now,
            updated_at: now,
            completed_at: None,
            audit_trail: Vec::new(),
            escalation_count: 0,
            revision: 0,
            steps,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step_count(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn step_record(&self, step_order: u32) -> Option<&StepExecutionRecord> {
        self.steps.iter().find(|r| r.step_order == step_order)
    }

    fn step_record_mut(&mut self, step_order: u32) -> ApprovalResult<&mut StepExecutionRecord> {
        let workflow_id = self.workflow_id.clone();
        self.steps
            .iter_mut()
            .find(|r| r.step_order == step_order)
            .ok_or(ApprovalError::StepNotFound {
                workflow_id,
                step_order,
            })
    }

    /// The actionable record, if the instance is still running
    pub fn open_step(&self) -> Option<&StepExecutionRecord> {
        if self.is_terminal() {
            None
        } else {
            self.step_record(self.current_step)
        }
    }

    /// When the open step becomes due for escalation under `timeout_secs`
    ///
    /// `None` when nothing is open or the deadline falls outside the
    /// representable time range; such a step is never due.
    pub fn escalation_due_at(&self, timeout_secs: u64) -> Option<DateTime<Utc>> {
        let opened_at = self.open_step()?.opened_at?;
        let secs = i64::try_from(timeout_secs).ok()?;
        opened_at.checked_add_signed(Duration::try_seconds(secs)?)
    }

    // ── Guards ───────────────────────────────────────────────────────

    pub fn ensure_not_terminal(&self) -> ApprovalResult<()> {
        if self.is_terminal() {
            return Err(ApprovalError::InstanceAlreadyTerminal {
                instance_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Running, and `step_order` is the open step
    pub fn ensure_open_step(&self, step_order: u32) -> ApprovalResult<()> {
        self.ensure_not_terminal()?;
        if step_order != self.current_step {
            return Err(ApprovalError::WrongStep {
                requested: step_order,
                current: self.current_step,
            });
        }
        Ok(())
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Record an approve/reject on the open step and advance.
    ///
    /// Returns the resulting status.
    pub fn record_decision(
        &mut self,
        step_order: u32,
        actor: &UserId,
        decision: Decision,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> ApprovalResult<InstanceStatus> {
        self.ensure_open_step(step_order)?;
        let is_last = step_order >= self.step_count();

        let record = self.step_record_mut(step_order)?;
        record.status = decision.step_status();
        record.decision = Some(decision);
        record.approver_id = Some(actor.clone());
        record.comments = comment;
        record.decided_at = Some(now);

        match decision {
            Decision::Reject => self.finish(InstanceStatus::Rejected, now),
            Decision::Approve if is_last => self.finish(InstanceStatus::Approved, now),
            Decision::Approve => {
                self.current_step += 1;
                let next = self.current_step;
                self.step_record_mut(next)?.opened_at = Some(now);
                self.status = InstanceStatus::InProgress;
            }
        }
        self.updated_at = now;
        Ok(self.status)
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> ApprovalResult<()> {
        self.ensure_not_terminal()?;
        self.finish(InstanceStatus::Cancelled, now);
        self.updated_at = now;
        Ok(())
    }

    /// Flag the open step as escalated. `current_step` is unchanged.
    pub fn escalate(&mut self, step_order: u32, now: DateTime<Utc>) -> ApprovalResult<()> {
        self.ensure_open_step(step_order)?;
        self.step_record_mut(step_order)?.escalated = true;
        self.escalation_count += 1;
        self.status = InstanceStatus::Escalated;
        self.updated_at = now;
        Ok(())
    }

    /// Record an advisory delegation on the open step
    pub fn delegate(
        &mut self,
        step_order: u32,
        from: &UserId,
        to: &UserId,
        now: DateTime<Utc>,
    ) -> ApprovalResult<()> {
        self.ensure_open_step(step_order)?;
        let record = self.step_record_mut(step_order)?;
        record.delegation_from = Some(from.clone());
        record.delegated_to = Some(to.clone());
        self.updated_at = now;
        Ok(())
    }

    /// Append an audit entry with the next sequence number.
    ///
    /// Timestamps never go backwards within one trail.
    pub fn append_audit(
        &mut self,
        actor_id: UserId,
        actor_display_name: impl Into<String>,
        action: AuditAction,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> &AuditEntry {
        let (sequence, timestamp) = match self.audit_trail.last() {
            Some(last) => (last.sequence + 1, now.max(last.timestamp)),
            None => (1, now),
        };
        self.audit_trail.push(AuditEntry {
            id: AuditEntryId::generate(),
            sequence,
            timestamp,
            actor_id,
            actor_display_name: actor_display_name.into(),
            action,
            details,
        });
        &self.audit_trail[self.audit_trail.len() - 1]
    }

    fn finish(&mut self, status: InstanceStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
    }
}

// ── Instance Status ──────────────────────────────────────────────────

/// Lifecycle state of an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Started, no step decided yet
    #[default]
    Pending,
    /// At least one step approved
    InProgress,
    Approved,
    Rejected,
    Cancelled,
    /// Open step flagged for escalation; still actionable
    Escalated,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            "escalated" => Ok(Self::Escalated),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

// ── Step Execution ───────────────────────────────────────────────────

/// An approver's verdict on a step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn step_status(&self) -> StepStatus {
        match self {
            Self::Approve => StepStatus::Approved,
            Self::Reject => StepStatus::Rejected,
        }
    }

    pub fn audit_action(&self) -> AuditAction {
        match self {
            Self::Approve => AuditAction::Approved,
            Self::Reject => AuditAction::Rejected,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// Runtime state of one step within an instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub step_order: u32,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    /// Set when the step becomes current
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_from: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_to: Option<UserId>,
}

impl StepExecutionRecord {
    pub fn pending(step_order: u32) -> Self {
        Self {
            step_order,
            status: StepStatus::Pending,
            decision: None,
            approver_id: None,
            comments: None,
            opened_at: None,
            decided_at: None,
            escalated: false,
            delegation_from: None,
            delegated_to: None,
        }
    }

    pub fn is_decided(&self) -> bool {
        self.status != StepStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{WorkflowDraft, WorkflowStep};
    use proptest::prelude::*;

    fn workflow(steps: u32) -> ApprovalWorkflow {
        let mut draft = WorkflowDraft::new("test");
        for order in 1..=steps {
            draft = draft.with_step(WorkflowStep::new(order, format!("step {order}")).with_user("u1"));
        }
        ApprovalWorkflow::create(WorkflowId::new("wf"), draft, UserId::new("admin"), Utc::now())
            .unwrap()
    }

    fn instance(steps: u32) -> ApprovalInstance {
        ApprovalInstance::new(
            &workflow(steps),
            RecordRef::new("change_requests", "CR-1"),
            UserId::new("requester"),
            Utc::now(),
        )
    }

    #[test]
    fn test_new_instance_opens_first_step() {
        let inst = instance(3);
        assert_eq!(inst.current_step, 1);
        assert_eq!(inst.status, InstanceStatus::Pending);
        assert_eq!(inst.steps.len(), 3);
        assert!(inst.steps.iter().all(|r| r.status == StepStatus::Pending));
        assert!(inst.steps[0].opened_at.is_some());
        assert!(inst.steps[1].opened_at.is_none());
    }

    #[test]
    fn test_approve_through_to_completion() {
        let mut inst = instance(2);
        let actor = UserId::new("u1");
        let now = Utc::now();

        let status = inst
            .record_decision(1, &actor, Decision::Approve, None, now)
            .unwrap();
        assert_eq!(status, InstanceStatus::InProgress);
        assert_eq!(inst.current_step, 2);
        assert!(inst.steps[1].opened_at.is_some());

        let status = inst
            .record_decision(2, &actor, Decision::Approve, Some("ok".into()), now)
            .unwrap();
        assert_eq!(status, InstanceStatus::Approved);
        assert_eq!(inst.current_step, 2);
        assert!(inst.completed_at.is_some());
        assert_eq!(inst.steps[1].comments.as_deref(), Some("ok"));
    }

    #[test]
    fn test_reject_is_terminal() {
        let mut inst = instance(3);
        let actor = UserId::new("u1");
        inst.record_decision(1, &actor, Decision::Reject, None, Utc::now())
            .unwrap();
        assert_eq!(inst.status, InstanceStatus::Rejected);

        let err = inst
            .record_decision(1, &actor, Decision::Approve, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ApprovalError::InstanceAlreadyTerminal { .. }));
        assert!(inst.cancel(Utc::now()).is_err());
    }

    #[test]
    fn test_wrong_step() {
        let mut inst = instance(2);
        let err = inst
            .record_decision(2, &UserId::new("u1"), Decision::Approve, None, Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            ApprovalError::WrongStep {
                requested: 2,
                current: 1
            }
        );
    }

    #[test]
    fn test_escalated_step_still_actionable() {
        let mut inst = instance(2);
        inst.escalate(1, Utc::now()).unwrap();
        assert_eq!(inst.status, InstanceStatus::Escalated);
        assert_eq!(inst.escalation_count, 1);
        assert!(inst.steps[0].escalated);

        inst.record_decision(1, &UserId::new("u1"), Decision::Approve, None, Utc::now())
            .unwrap();
        assert_eq!(inst.status, InstanceStatus::InProgress);
    }

    #[test]
    fn test_audit_sequence_and_clock() {
        let mut inst = instance(1);
        let later = Utc::now();
        let earlier = later - Duration::seconds(30);

        inst.append_audit(UserId::new("a"), "A", AuditAction::Created, serde_json::Value::Null, later);
        let entry = inst.append_audit(
            UserId::new("a"),
            "A",
            AuditAction::Approved,
            serde_json::Value::Null,
            earlier,
        );
        assert_eq!(entry.sequence, 2);
        assert_eq!(entry.timestamp, later);
    }

    #[test]
    fn test_escalation_due_at() {
        let inst = instance(1);
        let opened = inst.steps[0].opened_at.unwrap();
        assert_eq!(inst.escalation_due_at(60), Some(opened + Duration::seconds(60)));
    }

    #[test]
    fn test_escalation_due_at_out_of_range_is_never() {
        let inst = instance(1);
        assert_eq!(inst.escalation_due_at(u64::MAX), None);
        assert_eq!(inst.escalation_due_at(10_000_000_000_000_000), None);
        assert_eq!(inst.escalation_due_at(i64::MAX as u64), None);
        // In range for the delta, past the last representable date
        assert_eq!(
            inst.escalation_due_at(crate::MAX_ESCALATION_TIMEOUT_SECS),
            None
        );
    }

    #[derive(Clone, Debug)]
    enum Op {
        Approve(u32),
        Reject(u32),
        Escalate(u32),
        Cancel,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..5).prop_map(Op::Approve),
            (1u32..5).prop_map(Op::Reject),
            (1u32..5).prop_map(Op::Escalate),
            Just(Op::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn prop_current_step_monotone_and_bounded(steps in 1u32..5, ops in proptest::collection::vec(op(), 0..20)) {
            let mut inst = instance(steps);
            let actor = UserId::new("u1");
            let mut last_step = inst.current_step;

            for op in ops {
                let was_terminal = inst.is_terminal();
                let before = inst.clone();
                let result = match op {
                    Op::Approve(s) => inst.record_decision(s, &actor, Decision::Approve, None, Utc::now()).map(|_| ()),
                    Op::Reject(s) => inst.record_decision(s, &actor, Decision::Reject, None, Utc::now()).map(|_| ()),
                    Op::Escalate(s) => inst.escalate(s, Utc::now()),
                    Op::Cancel => inst.cancel(Utc::now()),
                };
                if was_terminal {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(&inst, &before);
                }
                prop_assert!(inst.current_step >= last_step);
                prop_assert!(inst.current_step >= 1 && inst.current_step <= steps);
                last_step = inst.current_step;
            }
        }
    }
}
