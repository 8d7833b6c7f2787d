//! Definition registry: creates, versions and retrieves approval workflows
//!
//! Workflow versions are immutable once stored. An edit stores a new
//! version; instances keep the version they started with. Versions are
//! cached by `(id, version)` since they never change.

use crate::config::RetryPolicy;
use crate::retry::{storage_error, with_retry};
use approval_storage::{ApprovalStorage, StorageError};
use approval_types::{
    ApprovalError, ApprovalResult, ApprovalWorkflow, UserId, WorkflowDraft, WorkflowId,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type VersionKey = (WorkflowId, u32);

/// Registry of approval workflow definitions
pub struct DefinitionRegistry {
    storage: Arc<dyn ApprovalStorage>,
    retry: RetryPolicy,
    conflict_retries: u32,
    cache: RwLock<HashMap<VersionKey, Arc<ApprovalWorkflow>>>,
}

impl DefinitionRegistry {
    pub fn new(storage: Arc<dyn ApprovalStorage>, retry: RetryPolicy, conflict_retries: u32) -> Self {
        Self {
            storage,
            retry,
            conflict_retries,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and store version 1 of a new workflow
    pub async fn create(
        &self,
        draft: WorkflowDraft,
        created_by: UserId,
    ) -> ApprovalResult<ApprovalWorkflow> {
        let workflow =
            ApprovalWorkflow::create(WorkflowId::generate(), draft, created_by, Utc::now())?;
        self.store_version(&workflow).await.map_err(storage_error)?;

        tracing::info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            steps = workflow.steps.len(),
            "Approval workflow created"
        );
        Ok(workflow)
    }

    /// Store `draft` as the next version of an existing workflow.
    ///
    /// Concurrent edits each get their own version; a lost race re-reads
    /// the latest version and tries again.
    pub async fn update(
        &self,
        workflow_id: &WorkflowId,
        draft: WorkflowDraft,
        updated_by: &UserId,
    ) -> ApprovalResult<ApprovalWorkflow> {
        for attempt in 0..=self.conflict_retries {
            let latest = self.get_latest(workflow_id).await?;
            let next = latest.next_version(draft.clone(), Utc::now())?;

            match self.store_version(&next).await {
                Ok(()) => {
                    tracing::info!(
                        workflow_id = %next.id,
                        version = next.version,
                        updated_by = %updated_by,
                        "Approval workflow updated"
                    );
                    return Ok(next);
                }
                Err(StorageError::Conflict(reason)) => {
                    tracing::warn!(
                        workflow_id = %workflow_id,
                        attempt,
                        %reason,
                        "Workflow version race lost, retrying"
                    );
                }
                Err(e) => return Err(storage_error(e)),
            }
        }
        Err(ApprovalError::ConcurrencyConflict(format!(
            "workflow {workflow_id}"
        )))
    }

    async fn store_version(&self, workflow: &ApprovalWorkflow) -> Result<(), StorageError> {
        let storage = &self.storage;
        with_retry(&self.retry, "insert_workflow_version", || {
            storage.insert_workflow_version(workflow.clone())
        })
        .await?;
        self.remember(Arc::new(workflow.clone()));
        Ok(())
    }

    /// Latest version of a workflow
    pub async fn get_latest(&self, workflow_id: &WorkflowId) -> ApprovalResult<ApprovalWorkflow> {
        let storage = &self.storage;
        with_retry(&self.retry, "get_latest_workflow", || {
            storage.get_latest_workflow(workflow_id)
        })
        .await
        .map_err(storage_error)?
        .ok_or_else(|| ApprovalError::WorkflowNotFound(workflow_id.clone()))
    }

    /// A specific version, served from cache when possible
    pub async fn get_version(
        &self,
        workflow_id: &WorkflowId,
        version: u32,
    ) -> ApprovalResult<Arc<ApprovalWorkflow>> {
        let key = (workflow_id.clone(), version);
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }

        let storage = &self.storage;
        let loaded = with_retry(&self.retry, "get_workflow_version", || {
            storage.get_workflow_version(workflow_id, version)
        })
        .await
        .map_err(storage_error)?;

        match loaded {
            Some(workflow) => {
                let workflow = Arc::new(workflow);
                self.remember(workflow.clone());
                Ok(workflow)
            }
            None => {
                let exists = self.get_latest(workflow_id).await.is_ok();
                if exists {
                    Err(ApprovalError::WorkflowVersionNotFound {
                        workflow_id: workflow_id.clone(),
                        version,
                    })
                } else {
                    Err(ApprovalError::WorkflowNotFound(workflow_id.clone()))
                }
            }
        }
    }

    /// Every version of a workflow, oldest first
    pub async fn list_versions(
        &self,
        workflow_id: &WorkflowId,
    ) -> ApprovalResult<Vec<ApprovalWorkflow>> {
        let storage = &self.storage;
        let versions = with_retry(&self.retry, "list_workflow_versions", || {
            storage.list_workflow_versions(workflow_id)
        })
        .await
        .map_err(storage_error)?;
        if versions.is_empty() {
            return Err(ApprovalError::WorkflowNotFound(workflow_id.clone()));
        }
        Ok(versions)
    }

    /// Latest version of every active workflow, highest priority first,
    /// ties broken by name
    pub async fn list_active(&self) -> ApprovalResult<Vec<ApprovalWorkflow>> {
        let storage = &self.storage;
        let mut active: Vec<ApprovalWorkflow> =
            with_retry(&self.retry, "list_latest_workflows", || {
                storage.list_latest_workflows()
            })
            .await
            .map_err(storage_error)?
            .into_iter()
            .filter(|w| w.is_active)
            .collect();
        active.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(active)
    }

    /// Number of cached versions
    pub fn cached_versions(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    fn cached(&self, key: &VersionKey) -> Option<Arc<ApprovalWorkflow>> {
        self.cache.read().ok()?.get(key).cloned()
    }

    fn remember(&self, workflow: Arc<ApprovalWorkflow>) {
        // A poisoned cache only costs a storage read
        if let Ok(mut cache) = self.cache.write() {
            cache.insert((workflow.id.clone(), workflow.version), workflow);
        }
    }
}
