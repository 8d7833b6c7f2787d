#![allow(dead_code)]

use approval_engine::{ApprovalEngine, BroadcastNotifier, EngineConfig, RetryPolicy};
use approval_storage::{ApprovalStorage, InMemoryApprovalStorage};
use approval_types::{ApprovalWorkflow, RecordRef, UserId, WorkflowDraft, WorkflowStep};
use rbac_identity::InMemoryIdentityStore;
use rbac_types::{Permission, Role, RoleId, User};
use std::sync::Arc;

pub struct Harness {
    pub engine: Arc<ApprovalEngine>,
    pub identity: Arc<InMemoryIdentityStore>,
    pub notifier: Arc<BroadcastNotifier>,
}

pub fn uid(id: &str) -> UserId {
    UserId::new(id)
}

pub fn record() -> RecordRef {
    RecordRef::new("change_requests", "CR-1042")
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        },
        ..EngineConfig::default()
    }
}

/// u1 and u3 are managers, u9 is a named approver, admin holds
/// `approvals:write`, u2 and requester have no roles
pub fn identity() -> InMemoryIdentityStore {
    let store = InMemoryIdentityStore::new();
    store.create_role(Role::new("r-manager", "manager")).unwrap();
    store
        .create_role(
            Role::new("r-approvals-admin", "approvals-admin")
                .with_permission(Permission::new("approvals", "write")),
        )
        .unwrap();

    for (id, name, role) in [
        ("u1", "User One", Some("r-manager")),
        ("u2", "User Two", None),
        ("u3", "User Three", Some("r-manager")),
        ("u9", "User Nine", None),
        ("admin", "Admin", Some("r-approvals-admin")),
        ("requester", "Requester", None),
    ] {
        let mut user = User::new(id, name);
        if let Some(role) = role {
            user.roles.insert(RoleId::new(role));
        }
        store.create_user(user).unwrap();
    }
    store
}

pub fn harness_with_storage(storage: Arc<dyn ApprovalStorage>, config: EngineConfig) -> Harness {
    let identity = Arc::new(identity());
    let notifier = Arc::new(BroadcastNotifier::new(64));
    let engine = ApprovalEngine::new(storage, identity.clone(), notifier.clone(), config);
    Harness {
        engine: Arc::new(engine),
        identity,
        notifier,
    }
}

pub fn harness() -> Harness {
    harness_with_storage(Arc::new(InMemoryApprovalStorage::new()), fast_config())
}

/// Step 1 by role `manager`, step 2 by user `u9`
pub fn two_step_draft() -> WorkflowDraft {
    WorkflowDraft::new("Change approval")
        .with_step(WorkflowStep::new(1, "Manager review").with_role("manager"))
        .with_step(WorkflowStep::new(2, "Owner sign-off").with_user("u9"))
}

pub async fn two_step_workflow(harness: &Harness) -> ApprovalWorkflow {
    harness
        .engine
        .create_workflow(two_step_draft(), &uid("admin"))
        .await
        .unwrap()
}
