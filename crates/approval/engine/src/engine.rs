//! Approval engine: the instance state machine
//!
//! Every mutating call follows the same shape. Load the instance, check the
//! transition against its current state, authorize the actor against live
//! identity data, apply the change and its audit entry to a copy, then
//! commit with a compare-and-swap on `(revision, status, current_step)`.
//! A lost swap re-reads and re-validates, so the loser of a race sees the
//! winner's state as `WrongStep` or `InstanceAlreadyTerminal`.

use crate::audit_trail::AuditTrail;
use crate::config::EngineConfig;
use crate::definition_registry::DefinitionRegistry;
use crate::notifier::ApprovalNotifier;
use crate::retry::{identity_error, storage_error, with_retry};
use crate::step_resolver::{EligibilityMemo, StepResolver};
use approval_storage::{ApprovalStorage, AuditRecord, CasGuard, QueryWindow, StorageError};
use approval_types::{
    ApprovalError, ApprovalInstance, ApprovalResult, ApprovalWorkflow, AuditAction, Decision,
    InstanceId, InstanceView, RecordRef, StartedApproval, UserId, WorkflowDraft, WorkflowId,
};
use chrono::Utc;
use rbac_identity::IdentityStore;
use rbac_resolver::{EffectiveAccess, PermissionResolver};
use std::future::Future;
use std::sync::Arc;

/// Permission that allows cancelling any approval
pub const CANCEL_PERMISSION: &str = "approvals:write";

/// Result of one guarded instance write
enum Swap {
    Committed(ApprovalInstance),
    Lost(String),
}

/// Sequential multi-step approval engine
pub struct ApprovalEngine {
    pub(crate) storage: Arc<dyn ApprovalStorage>,
    pub(crate) identity: Arc<dyn IdentityStore>,
    pub(crate) registry: DefinitionRegistry,
    pub(crate) permissions: PermissionResolver,
    pub(crate) resolver: StepResolver,
    pub(crate) audit: AuditTrail,
    pub(crate) notifier: Arc<dyn ApprovalNotifier>,
    pub(crate) config: EngineConfig,
}

impl ApprovalEngine {
    pub fn new(
        storage: Arc<dyn ApprovalStorage>,
        identity: Arc<dyn IdentityStore>,
        notifier: Arc<dyn ApprovalNotifier>,
        config: EngineConfig,
    ) -> Self {
        let permissions = PermissionResolver::new(identity.clone(), config.resolver_config());
        let resolver = StepResolver::new(permissions.clone());
        let registry = DefinitionRegistry::new(
            storage.clone(),
            config.retry.clone(),
            config.conflict_retries,
        );
        let audit = AuditTrail::new(storage.clone(), identity.clone(), config.retry.clone());

        Self {
            storage,
            identity,
            registry,
            permissions,
            resolver,
            audit,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    pub fn step_resolver(&self) -> &StepResolver {
        &self.resolver
    }

    pub fn permissions(&self) -> &PermissionResolver {
        &self.permissions
    }

    // ── Workflow definitions ─────────────────────────────────────────

    pub async fn create_workflow(
        &self,
        draft: WorkflowDraft,
        created_by: &UserId,
    ) -> ApprovalResult<ApprovalWorkflow> {
        self.registry.create(draft, created_by.clone()).await
    }

    /// Store a new version; running instances keep their pinned version
    pub async fn update_workflow(
        &self,
        workflow_id: &WorkflowId,
        draft: WorkflowDraft,
        updated_by: &UserId,
    ) -> ApprovalResult<ApprovalWorkflow> {
        self.registry.update(workflow_id, draft, updated_by).await
    }

    pub async fn get_workflow(&self, workflow_id: &WorkflowId) -> ApprovalResult<ApprovalWorkflow> {
        self.registry.get_latest(workflow_id).await
    }

    pub async fn get_workflow_version(
        &self,
        workflow_id: &WorkflowId,
        version: u32,
    ) -> ApprovalResult<ApprovalWorkflow> {
        let workflow = self.registry.get_version(workflow_id, version).await?;
        Ok(workflow.as_ref().clone())
    }

    pub async fn list_workflow_versions(
        &self,
        workflow_id: &WorkflowId,
    ) -> ApprovalResult<Vec<ApprovalWorkflow>> {
        self.registry.list_versions(workflow_id).await
    }

    pub async fn list_active_workflows(&self) -> ApprovalResult<Vec<ApprovalWorkflow>> {
        self.registry.list_active().await
    }

    // ── Instance lifecycle ───────────────────────────────────────────

    /// Start an approval of `record` against the latest version of a workflow
    pub async fn start_approval(
        &self,
        workflow_id: &WorkflowId,
        record: RecordRef,
        requested_by: &UserId,
    ) -> ApprovalResult<StartedApproval> {
        let workflow = self.registry.get_latest(workflow_id).await?;
        if !workflow.is_active {
            return Err(ApprovalError::WorkflowInactive(workflow_id.clone()));
        }

        let eligible: Vec<UserId> = self
            .resolver
            .resolve_eligible_approvers(&workflow, 1)
            .await?
            .into_iter()
            .collect();

        let now = Utc::now();
        let display_name = self.audit.display_name(requested_by).await;
        let details = serde_json::json!({
            "workflow_id": workflow.id,
            "workflow_version": workflow.version,
            "workflow_name": workflow.name,
            "record": record,
        });
        let mut instance = ApprovalInstance::new(&workflow, record, requested_by.clone(), now);
        instance.append_audit(
            requested_by.clone(),
            display_name,
            AuditAction::Created,
            details,
            now,
        );

        let storage = &self.storage;
        with_retry(&self.config.retry, "insert_instance", || {
            storage.insert_instance(instance.clone())
        })
        .await
        .map_err(storage_error)?;

        tracing::info!(
            instance_id = %instance.id,
            workflow_id = %workflow.id,
            version = workflow.version,
            record = %instance.record,
            requested_by = %requested_by,
            "Approval started"
        );
        if eligible.is_empty() {
            tracing::warn!(
                instance_id = %instance.id,
                step = 1,
                "No eligible approvers for opened step"
            );
        }

        self.after_commit(&instance).await;
        self.notifier.step_opened(&instance.id, 1, &eligible).await;

        Ok(StartedApproval {
            instance_id: instance.id,
            current_step: instance.current_step,
            status: instance.status,
            eligible_approvers: eligible,
        })
    }

    /// Approve or reject the open step
    pub async fn act(
        &self,
        instance_id: &InstanceId,
        step_order: u32,
        actor: &UserId,
        decision: Decision,
        comment: Option<String>,
    ) -> ApprovalResult<InstanceView> {
        let display_name = self.audit.display_name(actor).await;
        let display_name = &display_name;
        let comment = &comment;

        let stored = self
            .commit_transition(instance_id, "act", move |mut instance, workflow| async move {
                instance.ensure_open_step(step_order)?;
                self.ensure_eligible(&instance, &workflow, step_order, actor)
                    .await?;

                let now = Utc::now();
                let status =
                    instance.record_decision(step_order, actor, decision, comment.clone(), now)?;
                instance.append_audit(
                    actor.clone(),
                    display_name.clone(),
                    decision.audit_action(),
                    serde_json::json!({
                        "step_order": step_order,
                        "step_name": workflow.step(step_order).map(|s| s.name.clone()),
                        "comment": comment,
                        "status": status,
                    }),
                    now,
                );
                Ok(instance)
            })
            .await?;

        tracing::info!(
            instance_id = %stored.id,
            step = step_order,
            actor = %actor,
            decision = ?decision,
            status = %stored.status,
            "Approval step decided"
        );

        self.after_commit(&stored).await;
        let view = self.view(stored).await?;
        if view.instance.is_terminal() {
            self.notifier.completed(view.id(), view.status()).await;
        } else {
            self.notifier
                .step_opened(
                    view.id(),
                    view.instance.current_step,
                    &view.eligible_approvers,
                )
                .await;
        }
        Ok(view)
    }

    /// Cancel a running approval.
    ///
    /// Allowed for the original requester or anyone holding
    /// [`CANCEL_PERMISSION`].
    pub async fn cancel_approval(
        &self,
        instance_id: &InstanceId,
        actor: &UserId,
        reason: Option<String>,
    ) -> ApprovalResult<InstanceView> {
        let display_name = self.audit.display_name(actor).await;
        let display_name = &display_name;
        let reason = &reason;

        let stored = self
            .commit_transition(instance_id, "cancel", move |mut instance, _workflow| async move {
                instance.ensure_not_terminal()?;
                self.ensure_may_cancel(&instance, actor).await?;

                let now = Utc::now();
                let step_order = instance.current_step;
                instance.cancel(now)?;
                instance.append_audit(
                    actor.clone(),
                    display_name.clone(),
                    AuditAction::Cancelled,
                    serde_json::json!({
                        "step_order": step_order,
                        "reason": reason,
                    }),
                    now,
                );
                Ok(instance)
            })
            .await?;

        tracing::info!(instance_id = %stored.id, actor = %actor, "Approval cancelled");

        self.after_commit(&stored).await;
        self.notifier.completed(&stored.id, stored.status).await;
        self.view(stored).await
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get_instance(&self, instance_id: &InstanceId) -> ApprovalResult<InstanceView> {
        let instance = self.load_instance(instance_id).await?;
        self.view(instance).await
    }

    /// Running instances whose open step the user may act on, newest first
    pub async fn list_pending_for(&self, user_id: &UserId) -> ApprovalResult<Vec<InstanceView>> {
        let storage = &self.storage;
        let open = with_retry(&self.config.retry, "list_open_instances", || {
            storage.list_open_instances()
        })
        .await
        .map_err(storage_error)?;

        let mut memo = EligibilityMemo::default();
        let mut pending = Vec::new();
        for instance in open {
            let workflow = self
                .registry
                .get_version(&instance.workflow_id, instance.workflow_version)
                .await?;
            let eligible = memo
                .get(&self.resolver, &workflow, instance.current_step)
                .await?;
            if eligible.contains(user_id) {
                let eligible = eligible.iter().cloned().collect();
                pending.push(InstanceView::new(instance, eligible));
            }
        }

        tracing::debug!(user_id = %user_id, pending = pending.len(), "Listed pending approvals");
        Ok(pending)
    }

    /// Every instance attached to a business record, newest first
    pub async fn list_instances_for_record(
        &self,
        record: &RecordRef,
    ) -> ApprovalResult<Vec<ApprovalInstance>> {
        let storage = &self.storage;
        with_retry(&self.config.retry, "list_instances_for_record", || {
            storage.list_instances_for_record(record)
        })
        .await
        .map_err(storage_error)
    }

    pub async fn list_instances(&self, window: QueryWindow) -> ApprovalResult<Vec<ApprovalInstance>> {
        let storage = &self.storage;
        with_retry(&self.config.retry, "list_instances", || {
            storage.list_instances(window)
        })
        .await
        .map_err(storage_error)
    }

    /// Effective roles and permissions of a user
    pub async fn effective_access(&self, user_id: &UserId) -> ApprovalResult<EffectiveAccess> {
        self.permissions
            .resolve(user_id)
            .await
            .map_err(identity_error)
    }

    /// Global compliance log, newest first
    pub async fn audit_log(&self, window: QueryWindow) -> ApprovalResult<Vec<AuditRecord>> {
        self.audit.list(window).await
    }

    pub async fn audit_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> ApprovalResult<Vec<AuditRecord>> {
        self.audit.for_instance(instance_id).await
    }

    pub async fn verify_audit_log(&self) -> ApprovalResult<bool> {
        self.audit.verify().await
    }

    // ── Internals ────────────────────────────────────────────────────

    pub(crate) async fn load_instance(
        &self,
        instance_id: &InstanceId,
    ) -> ApprovalResult<ApprovalInstance> {
        let storage = &self.storage;
        with_retry(&self.config.retry, "get_instance", || {
            storage.get_instance(instance_id)
        })
        .await
        .map_err(storage_error)?
        .ok_or_else(|| ApprovalError::InstanceNotFound(instance_id.clone()))
    }

    /// Read-modify-write one instance under compare-and-swap.
    ///
    /// `apply` receives a fresh copy and its pinned workflow on every
    /// attempt and returns the next state, or an error that aborts the call.
    pub(crate) async fn commit_transition<F, Fut>(
        &self,
        instance_id: &InstanceId,
        operation: &'static str,
        mut apply: F,
    ) -> ApprovalResult<ApprovalInstance>
    where
        F: FnMut(ApprovalInstance, Arc<ApprovalWorkflow>) -> Fut,
        Fut: Future<Output = ApprovalResult<ApprovalInstance>>,
    {
        for attempt in 0..=self.config.conflict_retries {
            let current = self.load_instance(instance_id).await?;
            let workflow = self
                .registry
                .get_version(&current.workflow_id, current.workflow_version)
                .await?;
            let guard = CasGuard::of(&current);
            let next = apply(current, workflow).await?;

            match self.swap_instance(instance_id, guard, next, operation).await? {
                Swap::Committed(stored) => return Ok(stored),
                Swap::Lost(reason) => {
                    tracing::warn!(
                        instance_id = %instance_id,
                        operation,
                        attempt,
                        %reason,
                        "Lost instance update race, re-validating"
                    );
                }
            }
        }
        Err(ApprovalError::ConcurrencyConflict(format!(
            "instance {instance_id}"
        )))
    }

    /// One compare-and-swap, retried across transient failures.
    ///
    /// A transient error says nothing about whether the write landed, so
    /// the instance is re-read before trying again. Finding our own audit
    /// entry means the swap committed. An untouched row is swapped again.
    /// Any other change lost us the race.
    async fn swap_instance(
        &self,
        instance_id: &InstanceId,
        guard: CasGuard,
        next: ApprovalInstance,
        operation: &'static str,
    ) -> ApprovalResult<Swap> {
        let policy = &self.config.retry;
        let marker = next.audit_trail.last().map(|entry| entry.id.clone());
        let mut attempt = 1;
        loop {
            let err = match self
                .storage
                .compare_and_swap_instance(guard, next.clone())
                .await
            {
                Ok(stored) => return Ok(Swap::Committed(stored)),
                Err(StorageError::CasMismatch(reason)) => return Ok(Swap::Lost(reason)),
                Err(StorageError::NotFound(_)) => {
                    return Err(ApprovalError::InstanceNotFound(instance_id.clone()));
                }
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(storage_error(e)),
            };

            let stored = self.load_instance(instance_id).await?;
            let landed = stored.revision > guard.revision
                && marker
                    .as_ref()
                    .is_some_and(|id| stored.audit_trail.iter().any(|entry| &entry.id == id));
            if landed {
                tracing::info!(
                    instance_id = %instance_id,
                    operation,
                    error = %err,
                    "Instance update committed before its reply was lost"
                );
                let mut committed = next;
                committed.revision = guard.revision + 1;
                return Ok(Swap::Committed(committed));
            }
            if !guard.matches(&stored) {
                return Ok(Swap::Lost(format!(
                    "instance {instance_id} changed during a failed update"
                )));
            }
            if attempt >= policy.max_attempts {
                return Err(storage_error(err));
            }

            let delay = policy.backoff(attempt);
            tracing::warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient storage failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// `NotAuthorized` unless `actor` is in the live eligible set of the step
    pub(crate) async fn ensure_eligible(
        &self,
        instance: &ApprovalInstance,
        workflow: &ApprovalWorkflow,
        step_order: u32,
        actor: &UserId,
    ) -> ApprovalResult<()> {
        let eligible = self
            .resolver
            .resolve_eligible_approvers(workflow, step_order)
            .await?;
        if eligible.contains(actor) {
            return Ok(());
        }
        if eligible.is_empty() {
            tracing::warn!(
                instance_id = %instance.id,
                step = step_order,
                "No eligible approvers for open step"
            );
        }
        Err(ApprovalError::not_authorized(
            actor,
            format!("not an eligible approver for step {step_order}"),
        ))
    }

    async fn ensure_may_cancel(
        &self,
        instance: &ApprovalInstance,
        actor: &UserId,
    ) -> ApprovalResult<()> {
        if &instance.requested_by == actor {
            let requester = self.identity.get_user(actor).await.map_err(identity_error)?;
            if requester.is_some_and(|u| u.can_act()) {
                return Ok(());
            }
        }
        let allowed = self
            .permissions
            .has_permission(actor, CANCEL_PERMISSION)
            .await
            .map_err(identity_error)?;
        if allowed {
            Ok(())
        } else {
            Err(ApprovalError::not_authorized(
                actor,
                format!("requires {CANCEL_PERMISSION} or being the requester"),
            ))
        }
    }

    /// Mirror the newest trail entry into the global log
    pub(crate) async fn after_commit(&self, instance: &ApprovalInstance) {
        if let Some(entry) = instance.audit_trail.last() {
            self.audit.mirror(instance, entry).await;
        }
    }

    /// Project an instance with the live eligible set of its open step
    pub(crate) async fn view(&self, instance: ApprovalInstance) -> ApprovalResult<InstanceView> {
        if instance.is_terminal() {
            return Ok(InstanceView::new(instance, Vec::new()));
        }
        let workflow = self
            .registry
            .get_version(&instance.workflow_id, instance.workflow_version)
            .await?;
        let eligible = self
            .resolver
            .resolve_eligible_approvers(&workflow, instance.current_step)
            .await?
            .into_iter()
            .collect();
        Ok(InstanceView::new(instance, eligible))
    }
}
