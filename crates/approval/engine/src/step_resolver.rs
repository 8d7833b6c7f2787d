//! Step resolver: who may act on a step right now
//!
//! Eligibility is computed from live identity data on every call: the
//! step's explicit users plus every user whose effective role names
//! intersect the step's roles, restricted to users that exist and can act.

use crate::retry::identity_error;
use approval_types::{ApprovalError, ApprovalResult, ApprovalWorkflow, UserId};
use rbac_resolver::PermissionResolver;
use std::collections::{BTreeSet, HashMap};

/// Resolves concrete approver sets for workflow steps
#[derive(Clone)]
pub struct StepResolver {
    permissions: PermissionResolver,
}

impl StepResolver {
    pub fn new(permissions: PermissionResolver) -> Self {
        Self { permissions }
    }

    /// Users currently eligible to act on `step_order` of `workflow`.
    ///
    /// An empty set is a valid answer; `StepNotFound` if the step does not exist.
    pub async fn resolve_eligible_approvers(
        &self,
        workflow: &ApprovalWorkflow,
        step_order: u32,
    ) -> ApprovalResult<BTreeSet<UserId>> {
        let step = workflow
            .step(step_order)
            .ok_or_else(|| ApprovalError::StepNotFound {
                workflow_id: workflow.id.clone(),
                step_order,
            })?;
        let store = self.permissions.store();

        let mut eligible = BTreeSet::new();
        for user_id in &step.approver_users {
            match store.get_user(user_id).await.map_err(identity_error)? {
                Some(user) if user.can_act() => {
                    eligible.insert(user.id);
                }
                Some(_) => {
                    tracing::debug!(user_id = %user_id, step = step_order, "Explicit approver cannot act");
                }
                None => {
                    tracing::debug!(user_id = %user_id, step = step_order, "Explicit approver unknown");
                }
            }
        }

        if !step.approver_roles.is_empty() {
            let users = store.list_users().await.map_err(identity_error)?;
            for user in users.into_iter().filter(|u| u.can_act()) {
                if eligible.contains(&user.id) {
                    continue;
                }
                let roles = self
                    .permissions
                    .resolve_effective_role_names(&user.id)
                    .await
                    .map_err(identity_error)?;
                if !roles.is_disjoint(&step.approver_roles) {
                    eligible.insert(user.id);
                }
            }
        }

        tracing::debug!(
            workflow_id = %workflow.id,
            version = workflow.version,
            step = step_order,
            eligible = eligible.len(),
            "Resolved eligible approvers"
        );
        Ok(eligible)
    }

    pub async fn is_eligible(
        &self,
        workflow: &ApprovalWorkflow,
        step_order: u32,
        user_id: &UserId,
    ) -> ApprovalResult<bool> {
        Ok(self
            .resolve_eligible_approvers(workflow, step_order)
            .await?
            .contains(user_id))
    }
}

/// Per-call memo of eligible sets keyed by `(workflow, version, step)`.
///
/// Only valid for the duration of one read-only operation.
#[derive(Default)]
pub(crate) struct EligibilityMemo {
    sets: HashMap<(String, u32, u32), BTreeSet<UserId>>,
}

impl EligibilityMemo {
    pub(crate) async fn get(
        &mut self,
        resolver: &StepResolver,
        workflow: &ApprovalWorkflow,
        step_order: u32,
    ) -> ApprovalResult<&BTreeSet<UserId>> {
        let key = (workflow.id.0.clone(), workflow.version, step_order);
        if !self.sets.contains_key(&key) {
            let set = resolver
                .resolve_eligible_approvers(workflow, step_order)
                .await?;
            self.sets.insert(key.clone(), set);
        }
        self.sets
            .get(&key)
            .ok_or_else(|| ApprovalError::StepNotFound {
                workflow_id: workflow.id.clone(),
                step_order,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approval_types::{WorkflowDraft, WorkflowId, WorkflowStep};
    use chrono::Utc;
    use rbac_identity::InMemoryIdentityStore;
    use rbac_resolver::ResolverConfig;
    use rbac_types::{Group, GroupId, Role, RoleId, User};
    use std::sync::Arc;

    fn store() -> Arc<InMemoryIdentityStore> {
        let store = InMemoryIdentityStore::new();
        store.create_role(Role::new("r-mgr", "manager")).unwrap();
        store.create_role(Role::new("r-cab", "cab")).unwrap();

        let mut alice = User::new("alice", "Alice");
        alice.roles.insert(RoleId::new("r-mgr"));
        store.create_user(alice).unwrap();

        store.create_user(User::new("bob", "Bob")).unwrap();
        store.create_user(User::new("carol", "Carol")).unwrap();

        let mut cab = Group::new("g-cab", "Change board");
        cab.roles.insert(RoleId::new("r-cab"));
        store.create_group(cab).unwrap();
        store
            .add_member(&GroupId::new("g-cab"), &UserId::new("carol"))
            .unwrap();
        Arc::new(store)
    }

    fn workflow() -> ApprovalWorkflow {
        let draft = WorkflowDraft::new("Change")
            .with_step(WorkflowStep::new(1, "Manager").with_role("manager").with_user("bob"))
            .with_step(WorkflowStep::new(2, "CAB").with_role("cab"))
            .with_step(WorkflowStep::new(3, "Ghost").with_user("nobody"));
        ApprovalWorkflow::create(WorkflowId::new("wf"), draft, UserId::new("admin"), Utc::now())
            .unwrap()
    }

    fn resolver(store: Arc<InMemoryIdentityStore>) -> StepResolver {
        StepResolver::new(PermissionResolver::new(store, ResolverConfig::default()))
    }

    fn ids(names: &[&str]) -> BTreeSet<UserId> {
        names.iter().map(|n| UserId::new(*n)).collect()
    }

    #[tokio::test]
    async fn test_union_of_users_and_roles() {
        let resolver = resolver(store());
        let eligible = resolver
            .resolve_eligible_approvers(&workflow(), 1)
            .await
            .unwrap();
        assert_eq!(eligible, ids(&["alice", "bob"]));
    }

    #[tokio::test]
    async fn test_group_derived_role() {
        let resolver = resolver(store());
        let eligible = resolver
            .resolve_eligible_approvers(&workflow(), 2)
            .await
            .unwrap();
        assert_eq!(eligible, ids(&["carol"]));
    }

    #[tokio::test]
    async fn test_unknown_explicit_user_excluded() {
        let resolver = resolver(store());
        let eligible = resolver
            .resolve_eligible_approvers(&workflow(), 3)
            .await
            .unwrap();
        assert!(eligible.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_and_locked_users_excluded() {
        let store = store();
        store.deactivate_user(&UserId::new("alice")).unwrap();
        store.set_locked(&UserId::new("bob"), true).unwrap();
        let resolver = resolver(store);
        let eligible = resolver
            .resolve_eligible_approvers(&workflow(), 1)
            .await
            .unwrap();
        assert!(eligible.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_step() {
        let resolver = resolver(store());
        let err = resolver
            .resolve_eligible_approvers(&workflow(), 9)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "step_not_found");
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent_and_live() {
        let store = store();
        let resolver = resolver(store.clone());
        let wf = workflow();

        let first = resolver.resolve_eligible_approvers(&wf, 1).await.unwrap();
        let second = resolver.resolve_eligible_approvers(&wf, 1).await.unwrap();
        assert_eq!(first, second);

        store
            .revoke_role(&UserId::new("alice"), &RoleId::new("r-mgr"))
            .unwrap();
        let third = resolver.resolve_eligible_approvers(&wf, 1).await.unwrap();
        assert_eq!(third, ids(&["bob"]));
    }

    #[tokio::test]
    async fn test_memo_reuses_sets() {
        let resolver = resolver(store());
        let wf = workflow();
        let mut memo = EligibilityMemo::default();
        let first = memo.get(&resolver, &wf, 1).await.unwrap().clone();
        let again = memo.get(&resolver, &wf, 1).await.unwrap().clone();
        assert_eq!(first, again);
        assert_eq!(memo.sets.len(), 1);
    }
}
