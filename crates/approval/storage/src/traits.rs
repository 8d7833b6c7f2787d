use crate::model::{AuditAppend, AuditRecord, CasGuard};
use crate::StorageResult;
use approval_types::{ApprovalInstance, ApprovalWorkflow, InstanceId, RecordRef, WorkflowId};
use async_trait::async_trait;

/// Generic query window for paged reads. A zero limit means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl QueryWindow {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    pub fn all() -> Self {
        Self::default()
    }
}

/// Apply a window to an already-ordered list.
pub fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}

/// Storage interface for versioned workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a new version. The version must be exactly one past the
    /// latest stored version (or 1 for a new id), otherwise `Conflict`.
    async fn insert_workflow_version(&self, workflow: ApprovalWorkflow) -> StorageResult<()>;

    async fn get_workflow_version(
        &self,
        workflow_id: &WorkflowId,
        version: u32,
    ) -> StorageResult<Option<ApprovalWorkflow>>;

    async fn get_latest_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> StorageResult<Option<ApprovalWorkflow>>;

    /// All versions of one workflow, oldest first.
    async fn list_workflow_versions(
        &self,
        workflow_id: &WorkflowId,
    ) -> StorageResult<Vec<ApprovalWorkflow>>;

    /// Latest version of every workflow, in no particular order.
    async fn list_latest_workflows(&self) -> StorageResult<Vec<ApprovalWorkflow>>;
}

/// Storage interface for approval instances.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a new instance; `Conflict` if the id exists.
    async fn insert_instance(&self, instance: ApprovalInstance) -> StorageResult<()>;

    async fn get_instance(&self, instance_id: &InstanceId)
        -> StorageResult<Option<ApprovalInstance>>;

    /// Replace the stored instance if it still matches `expected`.
    ///
    /// On success the stored revision becomes `expected.revision + 1` and
    /// the stored instance is returned. `CasMismatch` if the guard no
    /// longer holds, `NotFound` if the instance does not exist.
    async fn compare_and_swap_instance(
        &self,
        expected: CasGuard,
        next: ApprovalInstance,
    ) -> StorageResult<ApprovalInstance>;

    /// Non-terminal instances, newest first.
    async fn list_open_instances(&self) -> StorageResult<Vec<ApprovalInstance>>;

    /// Instances attached to one business record, newest first.
    async fn list_instances_for_record(
        &self,
        record: &RecordRef,
    ) -> StorageResult<Vec<ApprovalInstance>>;

    /// All instances, newest first.
    async fn list_instances(&self, window: QueryWindow) -> StorageResult<Vec<ApprovalInstance>>;
}

/// Storage interface for the global append-only compliance log.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append an event and return the canonical, hash-linked stored record.
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditRecord>;

    /// Read events newest-first.
    async fn list_audit(&self, window: QueryWindow) -> StorageResult<Vec<AuditRecord>>;

    /// Events for one instance, oldest first.
    async fn list_audit_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> StorageResult<Vec<AuditRecord>>;

    /// Get the latest audit hash anchor.
    async fn latest_audit_hash(&self) -> StorageResult<Option<String>>;
}

/// Storage bundle consumed by the approval engine.
pub trait ApprovalStorage: WorkflowStore + InstanceStore + AuditStore + Send + Sync {}

impl<T> ApprovalStorage for T where T: WorkflowStore + InstanceStore + AuditStore + Send + Sync {}
