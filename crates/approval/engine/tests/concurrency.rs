mod common;

use approval_storage::{
    AuditAppend, AuditRecord, AuditStore, CasGuard, InMemoryApprovalStorage, InstanceStore,
    QueryWindow, StorageError, StorageResult, WorkflowStore,
};
use approval_types::{
    ApprovalError, ApprovalEvent, ApprovalInstance, ApprovalWorkflow, Decision, InstanceId,
    InstanceStatus, RecordRef, WorkflowDraft, WorkflowId, WorkflowStep,
};
use async_trait::async_trait;
use chrono::Utc;
use common::{fast_config, harness, harness_with_storage, record, two_step_workflow, uid};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

type Interference = Box<dyn FnOnce(&mut ApprovalInstance) + Send>;

/// In-memory storage that can fail reads and lose swaps on demand
#[derive(Default)]
struct ScriptedStorage {
    inner: InMemoryApprovalStorage,
    failing_reads: AtomicU32,
    failing_swaps: AtomicU32,
    lost_swap_replies: AtomicU32,
    interference: Mutex<Option<Interference>>,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl ScriptedStorage {
    fn fail_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` swaps without writing anything
    fn fail_swaps(&self, count: u32) {
        self.failing_swaps.store(count, Ordering::SeqCst);
    }

    /// Commit the next `count` swaps, then report a connection error
    fn lose_swap_replies(&self, count: u32) {
        self.lost_swap_replies.store(count, Ordering::SeqCst);
    }

    /// Apply `change` as a competing writer just before the next swap
    fn interfere(&self, change: impl FnOnce(&mut ApprovalInstance) + Send + 'static) {
        *self.interference.lock().unwrap() = Some(Box::new(change));
    }
}

#[async_trait]
impl WorkflowStore for ScriptedStorage {
    async fn insert_workflow_version(&self, workflow: ApprovalWorkflow) -> StorageResult<()> {
        self.inner.insert_workflow_version(workflow).await
    }

    async fn get_workflow_version(
        &self,
        workflow_id: &WorkflowId,
        version: u32,
    ) -> StorageResult<Option<ApprovalWorkflow>> {
        self.inner.get_workflow_version(workflow_id, version).await
    }

    async fn get_latest_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> StorageResult<Option<ApprovalWorkflow>> {
        self.inner.get_latest_workflow(workflow_id).await
    }

    async fn list_workflow_versions(
        &self,
        workflow_id: &WorkflowId,
    ) -> StorageResult<Vec<ApprovalWorkflow>> {
        self.inner.list_workflow_versions(workflow_id).await
    }

    async fn list_latest_workflows(&self) -> StorageResult<Vec<ApprovalWorkflow>> {
        self.inner.list_latest_workflows().await
    }
}

#[async_trait]
impl InstanceStore for ScriptedStorage {
    async fn insert_instance(&self, instance: ApprovalInstance) -> StorageResult<()> {
        self.inner.insert_instance(instance).await
    }

    async fn get_instance(
        &self,
        instance_id: &InstanceId,
    ) -> StorageResult<Option<ApprovalInstance>> {
        if take_one(&self.failing_reads) {
            return Err(StorageError::Backend("connection reset".into()));
        }
        self.inner.get_instance(instance_id).await
    }

    async fn compare_and_swap_instance(
        &self,
        expected: CasGuard,
        next: ApprovalInstance,
    ) -> StorageResult<ApprovalInstance> {
        let change = self.interference.lock().unwrap().take();
        if let Some(change) = change {
            let mut current = self.inner.get_instance(&next.id).await?.unwrap();
            let guard = CasGuard::of(&current);
            change(&mut current);
            self.inner.compare_and_swap_instance(guard, current).await?;
        }
        if take_one(&self.failing_swaps) {
            return Err(StorageError::Backend("connection refused".into()));
        }
        let stored = self.inner.compare_and_swap_instance(expected, next).await?;
        if take_one(&self.lost_swap_replies) {
            return Err(StorageError::Backend("connection reset after commit".into()));
        }
        Ok(stored)
    }

    async fn list_open_instances(&self) -> StorageResult<Vec<ApprovalInstance>> {
        self.inner.list_open_instances().await
    }

    async fn list_instances_for_record(
        &self,
        record: &RecordRef,
    ) -> StorageResult<Vec<ApprovalInstance>> {
        self.inner.list_instances_for_record(record).await
    }

    async fn list_instances(&self, window: QueryWindow) -> StorageResult<Vec<ApprovalInstance>> {
        self.inner.list_instances(window).await
    }
}

#[async_trait]
impl AuditStore for ScriptedStorage {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditRecord> {
        self.inner.append_audit(event).await
    }

    async fn list_audit(&self, window: QueryWindow) -> StorageResult<Vec<AuditRecord>> {
        self.inner.list_audit(window).await
    }

    async fn list_audit_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> StorageResult<Vec<AuditRecord>> {
        self.inner.list_audit_for_instance(instance_id).await
    }

    async fn latest_audit_hash(&self) -> StorageResult<Option<String>> {
        self.inner.latest_audit_hash().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acts_on_same_step_have_one_winner() {
    let h = harness();
    let wf = two_step_workflow(&h).await;

    for _ in 0..20 {
        let id = h
            .engine
            .start_approval(&wf.id, record(), &uid("requester"))
            .await
            .unwrap()
            .instance_id;

        let mut tasks = Vec::new();
        for (actor, decision) in [("u1", Decision::Approve), ("u3", Decision::Reject)] {
            let engine = h.engine.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                engine.act(&id, 1, &uid(actor), decision, None).await
            }));
        }

        let mut wins = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => wins += 1,
                Err(err) => assert!(
                    matches!(
                        err,
                        ApprovalError::WrongStep { .. } | ApprovalError::InstanceAlreadyTerminal { .. }
                    ),
                    "unexpected loser error {err}"
                ),
            }
        }
        assert_eq!(wins, 1);

        let instance = h.engine.get_instance(&id).await.unwrap().instance;
        assert_eq!(instance.audit_trail.len(), 2);
        assert_eq!(instance.steps[0].approver_id.iter().count(), 1);
    }
}

#[tokio::test]
async fn test_lost_swap_revalidates_against_winner() {
    let storage = Arc::new(ScriptedStorage::default());
    let h = harness_with_storage(storage.clone(), fast_config());
    let wf = two_step_workflow(&h).await;
    let id = h
        .engine
        .start_approval(&wf.id, record(), &uid("requester"))
        .await
        .unwrap()
        .instance_id;

    // Another writer cancels between our read and our swap
    storage.interfere(|instance| {
        instance.cancel(Utc::now()).unwrap();
    });
    let err = h
        .engine
        .act(&id, 1, &uid("u1"), Decision::Approve, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ApprovalError::InstanceAlreadyTerminal {
            instance_id: id.clone(),
            status: InstanceStatus::Cancelled,
        }
    );
}

#[tokio::test]
async fn test_lost_swap_on_unrelated_change_retries() {
    let storage = Arc::new(ScriptedStorage::default());
    let h = harness_with_storage(storage.clone(), fast_config());
    let wf = two_step_workflow(&h).await;
    let id = h
        .engine
        .start_approval(&wf.id, record(), &uid("requester"))
        .await
        .unwrap()
        .instance_id;

    // A concurrent delegation bumps the revision but leaves the step open
    storage.interfere(|instance| {
        instance
            .delegate(1, &uid("u3"), &uid("u1"), Utc::now())
            .unwrap();
    });
    let view = h
        .engine
        .act(&id, 1, &uid("u1"), Decision::Approve, None)
        .await
        .unwrap();
    assert_eq!(view.instance.current_step, 2);
    assert_eq!(view.instance.steps[0].delegated_to, Some(uid("u1")));
    assert_eq!(view.instance.revision, 2);
}

#[tokio::test]
async fn test_transient_read_failures_are_retried() {
    let storage = Arc::new(ScriptedStorage::default());
    let h = harness_with_storage(storage.clone(), fast_config());
    let wf = two_step_workflow(&h).await;
    let id = h
        .engine
        .start_approval(&wf.id, record(), &uid("requester"))
        .await
        .unwrap()
        .instance_id;

    storage.fail_reads(2);
    let view = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(view.instance.current_step, 1);

    storage.fail_reads(10);
    let err = h.engine.get_instance(&id).await.unwrap_err();
    assert!(matches!(err, ApprovalError::StorageUnavailable(_)));
    assert_eq!(err.code(), "storage_unavailable");
}

#[tokio::test]
async fn test_swap_committed_before_reply_lost_is_success() {
    let storage = Arc::new(ScriptedStorage::default());
    let h = harness_with_storage(storage.clone(), fast_config());
    let wf = two_step_workflow(&h).await;
    let id = h
        .engine
        .start_approval(&wf.id, record(), &uid("requester"))
        .await
        .unwrap()
        .instance_id;

    storage.lose_swap_replies(1);
    let view = h
        .engine
        .act(&id, 1, &uid("u1"), Decision::Approve, None)
        .await
        .unwrap();
    assert_eq!(view.instance.current_step, 2);
    assert_eq!(view.instance.status, InstanceStatus::InProgress);
    assert_eq!(view.instance.revision, 1);
    assert_eq!(view.eligible_approvers, vec![uid("u9")]);

    let stored = h.engine.get_instance(&id).await.unwrap().instance;
    assert_eq!(stored.revision, 1);
    assert_eq!(stored.audit_trail.len(), 2);

    // Exactly one global entry per state change
    let global = h.engine.audit_for_instance(&id).await.unwrap();
    let actions: Vec<_> = global.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(actions, vec!["created", "approved"]);
}

#[tokio::test]
async fn test_lost_reply_after_final_step_reports_approved() {
    let storage = Arc::new(ScriptedStorage::default());
    let h = harness_with_storage(storage.clone(), fast_config());
    let draft = WorkflowDraft::new("Single")
        .with_step(WorkflowStep::new(1, "Manager").with_role("manager"));
    let wf = h.engine.create_workflow(draft, &uid("admin")).await.unwrap();
    let id = h
        .engine
        .start_approval(&wf.id, record(), &uid("requester"))
        .await
        .unwrap()
        .instance_id;

    let mut events = h.notifier.subscribe();
    storage.lose_swap_replies(1);
    let view = h
        .engine
        .act(&id, 1, &uid("u1"), Decision::Approve, None)
        .await
        .unwrap();
    assert_eq!(view.instance.status, InstanceStatus::Approved);
    assert!(matches!(
        events.try_recv(),
        Ok(ApprovalEvent::Completed {
            status: InstanceStatus::Approved,
            ..
        })
    ));
}

#[tokio::test]
async fn test_swap_failing_before_commit_is_retried() {
    let storage = Arc::new(ScriptedStorage::default());
    let h = harness_with_storage(storage.clone(), fast_config());
    let wf = two_step_workflow(&h).await;
    let id = h
        .engine
        .start_approval(&wf.id, record(), &uid("requester"))
        .await
        .unwrap()
        .instance_id;

    storage.fail_swaps(1);
    let view = h
        .engine
        .act(&id, 1, &uid("u1"), Decision::Approve, None)
        .await
        .unwrap();
    assert_eq!(view.instance.current_step, 2);
    assert_eq!(view.instance.audit_trail.len(), 2);

    storage.fail_swaps(10);
    let err = h
        .engine
        .act(&id, 2, &uid("u9"), Decision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::StorageUnavailable(_)));

    let stored = h.engine.get_instance(&id).await.unwrap().instance;
    assert_eq!(stored.current_step, 2);
    assert_eq!(stored.status, InstanceStatus::InProgress);
    assert_eq!(h.engine.audit_for_instance(&id).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_instances_progress_in_parallel() {
    let h = harness();
    let draft = WorkflowDraft::new("Single")
        .with_step(WorkflowStep::new(1, "Manager").with_role("manager"));
    let wf = h.engine.create_workflow(draft, &uid("admin")).await.unwrap();

    let mut ids = Vec::new();
    for n in 0..16 {
        let record = RecordRef::new("change_requests", format!("CR-{n}"));
        ids.push(
            h.engine
                .start_approval(&wf.id, record, &uid("requester"))
                .await
                .unwrap()
                .instance_id,
        );
    }

    let mut tasks = Vec::new();
    for id in ids.clone() {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.act(&id, 1, &uid("u1"), Decision::Approve, None).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().status(), InstanceStatus::Approved);
    }
    assert!(h.engine.list_pending_for(&uid("u1")).await.unwrap().is_empty());
}
