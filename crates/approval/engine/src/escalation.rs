//! Delegation and escalation of open steps
//!
//! Delegation is advisory: it records who handed the step to whom but does
//! not change who may act. Escalation flags a step that has been open too
//! long; it is triggered externally, typically by a scheduler polling
//! [`ApprovalEngine::due_for_escalation`].

use crate::engine::ApprovalEngine;
use crate::retry::{identity_error, storage_error, with_retry};
use approval_types::{
    ApprovalError, ApprovalResult, AuditAction, EscalationCandidate, InstanceId, InstanceView,
    UserId, SYSTEM_ACTOR,
};
use chrono::{DateTime, Utc};

impl ApprovalEngine {
    /// Record that `from_user` handed the open step to `to_user`
    pub async fn delegate(
        &self,
        instance_id: &InstanceId,
        step_order: u32,
        from_user: &UserId,
        to_user: &UserId,
        reason: Option<String>,
    ) -> ApprovalResult<InstanceView> {
        let display_name = self.audit.display_name(from_user).await;
        let display_name = &display_name;
        let reason = &reason;

        let stored = self
            .commit_transition(instance_id, "delegate", move |mut instance, workflow| async move {
                instance.ensure_open_step(step_order)?;
                self.ensure_eligible(&instance, &workflow, step_order, from_user)
                    .await?;

                if from_user == to_user {
                    return Err(ApprovalError::InvalidDelegation(
                        "cannot delegate to yourself".to_string(),
                    ));
                }
                let target = self
                    .identity
                    .get_user(to_user)
                    .await
                    .map_err(identity_error)?
                    .ok_or_else(|| ApprovalError::UserNotFound(to_user.clone()))?;
                if !target.can_act() {
                    return Err(ApprovalError::InvalidDelegation(format!(
                        "user {to_user} is inactive or locked"
                    )));
                }

                let now = Utc::now();
                instance.delegate(step_order, from_user, to_user, now)?;
                instance.append_audit(
                    from_user.clone(),
                    display_name.clone(),
                    AuditAction::Delegated,
                    serde_json::json!({
                        "step_order": step_order,
                        "from": from_user,
                        "to": to_user,
                        "reason": reason,
                    }),
                    now,
                );
                Ok(instance)
            })
            .await?;

        tracing::info!(
            instance_id = %stored.id,
            step = step_order,
            from = %from_user,
            to = %to_user,
            "Approval step delegated"
        );

        self.after_commit(&stored).await;
        self.view(stored).await
    }

    /// Flag the open step as escalated.
    ///
    /// Escalating an already escalated step counts again.
    pub async fn escalate(
        &self,
        instance_id: &InstanceId,
        step_order: u32,
        reason: Option<String>,
    ) -> ApprovalResult<InstanceView> {
        let system = UserId::new(SYSTEM_ACTOR);
        let system = &system;
        let reason = &reason;

        let stored = self
            .commit_transition(instance_id, "escalate", move |mut instance, _workflow| async move {
                let now = Utc::now();
                instance.escalate(step_order, now)?;
                let escalation_count = instance.escalation_count;
                instance.append_audit(
                    system.clone(),
                    "System",
                    AuditAction::Escalated,
                    serde_json::json!({
                        "step_order": step_order,
                        "reason": reason,
                        "escalation_count": escalation_count,
                    }),
                    now,
                );
                Ok(instance)
            })
            .await?;

        tracing::info!(
            instance_id = %stored.id,
            step = step_order,
            escalation_count = stored.escalation_count,
            "Approval step escalated"
        );

        self.after_commit(&stored).await;
        self.view(stored).await
    }

    /// Open steps past their escalation timeout that are not yet escalated,
    /// oldest due first
    pub async fn due_for_escalation(
        &self,
        now: DateTime<Utc>,
    ) -> ApprovalResult<Vec<EscalationCandidate>> {
        let storage = &self.storage;
        let open = with_retry(&self.config.retry, "list_open_instances", || {
            storage.list_open_instances()
        })
        .await
        .map_err(storage_error)?;

        let mut due = Vec::new();
        for instance in open {
            let Some(record) = instance.open_step() else {
                continue;
            };
            if record.escalated {
                continue;
            }
            let workflow = self
                .registry
                .get_version(&instance.workflow_id, instance.workflow_version)
                .await?;
            let Some(timeout) = workflow
                .step(instance.current_step)
                .and_then(|s| s.escalation_timeout_secs)
            else {
                continue;
            };
            let (Some(opened_at), Some(due_at)) =
                (record.opened_at, instance.escalation_due_at(timeout))
            else {
                continue;
            };
            if due_at <= now {
                due.push(EscalationCandidate {
                    instance_id: instance.id.clone(),
                    step_order: instance.current_step,
                    opened_at,
                    due_at,
                    escalation_count: instance.escalation_count,
                });
            }
        }

        due.sort_by(|a, b| {
            a.due_at
                .cmp(&b.due_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(due)
    }
}
