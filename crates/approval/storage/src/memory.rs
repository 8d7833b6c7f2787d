//! In-memory reference implementation of the approval storage traits.
//!
//! Deterministic and test-friendly. Each map has its own lock, held only
//! for the duration of a single read or compare-and-swap.

use crate::model::{compute_audit_hash, AuditAppend, AuditRecord, CasGuard};
use crate::traits::{apply_window, AuditStore, InstanceStore, QueryWindow, WorkflowStore};
use crate::{StorageError, StorageResult};
use approval_types::{ApprovalInstance, ApprovalWorkflow, InstanceId, RecordRef, WorkflowId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// In-memory approval storage adapter.
#[derive(Default)]
pub struct InMemoryApprovalStorage {
    /// Versions per workflow, ascending
    workflows: RwLock<HashMap<WorkflowId, Vec<ApprovalWorkflow>>>,
    instances: RwLock<HashMap<InstanceId, ApprovalInstance>>,
    audits: RwLock<Vec<AuditRecord>>,
}

impl InMemoryApprovalStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(name: &str) -> StorageError {
    StorageError::Backend(format!("{name} lock poisoned"))
}

fn newest_first(values: &mut [ApprovalInstance]) {
    values.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[async_trait]
impl WorkflowStore for InMemoryApprovalStorage {
    async fn insert_workflow_version(&self, workflow: ApprovalWorkflow) -> StorageResult<()> {
        let mut guard = self.workflows.write().map_err(|_| poisoned("workflows"))?;
        let versions = guard.entry(workflow.id.clone()).or_default();
        let latest = versions.last().map(|w| w.version).unwrap_or(0);
        if workflow.version != latest + 1 {
            return Err(StorageError::Conflict(format!(
                "workflow {} is at version {}, cannot store version {}",
                workflow.id, latest, workflow.version
            )));
        }
        versions.push(workflow);
        Ok(())
    }

    async fn get_workflow_version(
        &self,
        workflow_id: &WorkflowId,
        version: u32,
    ) -> StorageResult<Option<ApprovalWorkflow>> {
        let guard = self.workflows.read().map_err(|_| poisoned("workflows"))?;
        Ok(guard
            .get(workflow_id)
            .and_then(|versions| versions.iter().find(|w| w.version == version))
            .cloned())
    }

    async fn get_latest_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> StorageResult<Option<ApprovalWorkflow>> {
        let guard = self.workflows.read().map_err(|_| poisoned("workflows"))?;
        Ok(guard
            .get(workflow_id)
            .and_then(|versions| versions.last())
            .cloned())
    }

    async fn list_workflow_versions(
        &self,
        workflow_id: &WorkflowId,
    ) -> StorageResult<Vec<ApprovalWorkflow>> {
        let guard = self.workflows.read().map_err(|_| poisoned("workflows"))?;
        Ok(guard.get(workflow_id).cloned().unwrap_or_default())
    }

    async fn list_latest_workflows(&self) -> StorageResult<Vec<ApprovalWorkflow>> {
        let guard = self.workflows.read().map_err(|_| poisoned("workflows"))?;
        Ok(guard
            .values()
            .filter_map(|versions| versions.last().cloned())
            .collect())
    }
}

#[async_trait]
impl InstanceStore for InMemoryApprovalStorage {
    async fn insert_instance(&self, instance: ApprovalInstance) -> StorageResult<()> {
        let mut guard = self.instances.write().map_err(|_| poisoned("instances"))?;
        if guard.contains_key(&instance.id) {
            return Err(StorageError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        guard.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn get_instance(
        &self,
        instance_id: &InstanceId,
    ) -> StorageResult<Option<ApprovalInstance>> {
        let guard = self.instances.read().map_err(|_| poisoned("instances"))?;
        Ok(guard.get(instance_id).cloned())
    }

    async fn compare_and_swap_instance(
        &self,
        expected: CasGuard,
        mut next: ApprovalInstance,
    ) -> StorageResult<ApprovalInstance> {
        let mut guard = self.instances.write().map_err(|_| poisoned("instances"))?;
        let stored = guard
            .get_mut(&next.id)
            .ok_or_else(|| StorageError::NotFound(format!("instance {} not found", next.id)))?;

        if !expected.matches(stored) {
            return Err(StorageError::CasMismatch(format!(
                "instance {}: expected revision {} ({}, step {}), found revision {} ({}, step {})",
                next.id,
                expected.revision,
                expected.status,
                expected.current_step,
                stored.revision,
                stored.status,
                stored.current_step
            )));
        }

        next.revision = expected.revision + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_open_instances(&self) -> StorageResult<Vec<ApprovalInstance>> {
        let guard = self.instances.read().map_err(|_| poisoned("instances"))?;
        let mut values = guard
            .values()
            .filter(|i| !i.is_terminal())
            .cloned()
            .collect::<Vec<_>>();
        newest_first(&mut values);
        Ok(values)
    }

    async fn list_instances_for_record(
        &self,
        record: &RecordRef,
    ) -> StorageResult<Vec<ApprovalInstance>> {
        let guard = self.instances.read().map_err(|_| poisoned("instances"))?;
        let mut values = guard
            .values()
            .filter(|i| &i.record == record)
            .cloned()
            .collect::<Vec<_>>();
        newest_first(&mut values);
        Ok(values)
    }

    async fn list_instances(&self, window: QueryWindow) -> StorageResult<Vec<ApprovalInstance>> {
        let guard = self.instances.read().map_err(|_| poisoned("instances"))?;
        let mut values = guard.values().cloned().collect::<Vec<_>>();
        newest_first(&mut values);
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl AuditStore for InMemoryApprovalStorage {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditRecord> {
        let mut guard = self.audits.write().map_err(|_| poisoned("audit"))?;

        let previous_hash = guard.last().map(|e| e.hash.clone());
        let sequence = guard.len() as u64 + 1;
        let hash = compute_audit_hash(&event, previous_hash.as_deref(), sequence)?;

        let record = AuditRecord::from_append(
            event,
            format!("audit-{}", Uuid::new_v4()),
            sequence,
            previous_hash,
            hash,
        );
        guard.push(record.clone());
        Ok(record)
    }

    async fn list_audit(&self, window: QueryWindow) -> StorageResult<Vec<AuditRecord>> {
        let guard = self.audits.read().map_err(|_| poisoned("audit"))?;
        let mut values = guard.clone();
        values.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(apply_window(values, window))
    }

    async fn list_audit_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> StorageResult<Vec<AuditRecord>> {
        let guard = self.audits.read().map_err(|_| poisoned("audit"))?;
        Ok(guard
            .iter()
            .filter(|r| r.instance_id.as_ref() == Some(instance_id))
            .cloned()
            .collect())
    }

    async fn latest_audit_hash(&self) -> StorageResult<Option<String>> {
        let guard = self.audits.read().map_err(|_| poisoned("audit"))?;
        Ok(guard.last().map(|e| e.hash.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify_audit_chain;
    use approval_types::{Decision, WorkflowDraft, WorkflowStep};
    use chrono::{Duration, Utc};
    use rbac_types::UserId;

    fn workflow() -> ApprovalWorkflow {
        let draft = WorkflowDraft::new("Purchase approval")
            .with_step(WorkflowStep::new(1, "Manager").with_role("manager"))
            .with_step(WorkflowStep::new(2, "Finance").with_user("u-fin"));
        ApprovalWorkflow::create(WorkflowId::new("wf-1"), draft, UserId::new("admin"), Utc::now())
            .unwrap()
    }

    fn instance(workflow: &ApprovalWorkflow) -> ApprovalInstance {
        ApprovalInstance::new(
            workflow,
            RecordRef::new("purchase_orders", "PO-7"),
            UserId::new("u-req"),
            Utc::now(),
        )
    }

    fn append(actor: &str, action: &str) -> AuditAppend {
        AuditAppend {
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            instance_id: Some(InstanceId::new("i-1")),
            workflow_id: None,
            payload: serde_json::json!({"step": 1}),
        }
    }

    #[tokio::test]
    async fn workflow_versions_must_be_contiguous() {
        let storage = InMemoryApprovalStorage::new();
        let v1 = workflow();
        storage.insert_workflow_version(v1.clone()).await.unwrap();

        let dup = storage.insert_workflow_version(v1.clone()).await;
        assert!(matches!(dup, Err(StorageError::Conflict(_))));

        let v2 = v1.next_version(v1.to_draft(), Utc::now()).unwrap();
        storage.insert_workflow_version(v2).await.unwrap();

        let latest = storage.get_latest_workflow(&v1.id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        let first = storage.get_workflow_version(&v1.id, 1).await.unwrap().unwrap();
        assert_eq!(first, v1);
        assert_eq!(storage.list_workflow_versions(&v1.id).await.unwrap().len(), 2);
        assert_eq!(storage.list_latest_workflows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compare_and_swap_bumps_revision() {
        let storage = InMemoryApprovalStorage::new();
        let wf = workflow();
        let inst = instance(&wf);
        storage.insert_instance(inst.clone()).await.unwrap();

        let guard = CasGuard::of(&inst);
        let mut next = inst.clone();
        next.record_decision(1, &UserId::new("u-mgr"), Decision::Approve, None, Utc::now())
            .unwrap();

        let stored = storage.compare_and_swap_instance(guard, next).await.unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.current_step, 2);

        // Same guard again: the instance has moved on
        let mut stale = inst.clone();
        stale
            .record_decision(1, &UserId::new("u-mgr"), Decision::Reject, None, Utc::now())
            .unwrap();
        let result = storage.compare_and_swap_instance(guard, stale).await;
        assert!(matches!(result, Err(StorageError::CasMismatch(_))));
    }

    #[tokio::test]
    async fn compare_and_swap_missing_instance() {
        let storage = InMemoryApprovalStorage::new();
        let inst = instance(&workflow());
        let result = storage
            .compare_and_swap_instance(CasGuard::of(&inst), inst)
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn open_and_record_listings() {
        let storage = InMemoryApprovalStorage::new();
        let wf = workflow();

        let mut older = instance(&wf);
        older.created_at = Utc::now() - Duration::minutes(5);
        let newer = instance(&wf);
        let mut done = instance(&wf);
        done.cancel(Utc::now()).unwrap();

        for i in [older.clone(), newer.clone(), done.clone()] {
            storage.insert_instance(i).await.unwrap();
        }

        let open = storage.list_open_instances().await.unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].id, newer.id);
        assert_eq!(open[1].id, older.id);

        let for_record = storage
            .list_instances_for_record(&RecordRef::new("purchase_orders", "PO-7"))
            .await
            .unwrap();
        assert_eq!(for_record.len(), 3);
        assert!(storage
            .list_instances_for_record(&RecordRef::new("purchase_orders", "PO-8"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn audit_chain_hashes_are_linked() {
        let storage = InMemoryApprovalStorage::new();
        let first = storage.append_audit(append("u-req", "created")).await.unwrap();
        let second = storage.append_audit(append("u-mgr", "approved")).await.unwrap();

        assert_eq!(second.previous_hash, Some(first.hash.clone()));
        assert_eq!(second.sequence, 2);
        assert_eq!(
            storage.latest_audit_hash().await.unwrap(),
            Some(second.hash.clone())
        );

        let mut chain = storage.list_audit(QueryWindow::all()).await.unwrap();
        chain.reverse();
        verify_audit_chain(&chain).unwrap();

        chain[0].actor = "mallory".to_string();
        assert!(verify_audit_chain(&chain).is_err());
    }

    #[tokio::test]
    async fn audit_listing_by_instance() {
        let storage = InMemoryApprovalStorage::new();
        storage.append_audit(append("u-req", "created")).await.unwrap();
        let mut other = append("u-req", "created");
        other.instance_id = Some(InstanceId::new("i-2"));
        storage.append_audit(other).await.unwrap();

        let records = storage
            .list_audit_for_instance(&InstanceId::new("i-1"))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);

        let page = storage.list_audit(QueryWindow::new(1, 0)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].sequence, 2);
    }
}
