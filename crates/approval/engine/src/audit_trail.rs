//! Audit trail: actor naming and the global compliance log
//!
//! Each instance carries its own append-only trail, committed together
//! with the transition it describes. After commit the entry is mirrored
//! into the storage-wide, hash-chained log.

use crate::config::RetryPolicy;
use crate::retry::{storage_error, with_retry};
use approval_storage::{verify_audit_chain, ApprovalStorage, AuditAppend, AuditRecord, QueryWindow};
use approval_types::{ApprovalInstance, ApprovalResult, AuditEntry, InstanceId, UserId, SYSTEM_ACTOR};
use rbac_identity::IdentityStore;
use std::sync::Arc;

/// Writes and reads the compliance audit log
pub struct AuditTrail {
    storage: Arc<dyn ApprovalStorage>,
    identity: Arc<dyn IdentityStore>,
    retry: RetryPolicy,
}

impl AuditTrail {
    pub fn new(
        storage: Arc<dyn ApprovalStorage>,
        identity: Arc<dyn IdentityStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            identity,
            retry,
        }
    }

    /// Display name for an actor, falling back to the id
    pub async fn display_name(&self, actor: &UserId) -> String {
        if actor.as_str() == SYSTEM_ACTOR {
            return "System".to_string();
        }
        match self.identity.get_user(actor).await {
            Ok(Some(user)) => user.display_name,
            Ok(None) => actor.to_string(),
            Err(e) => {
                tracing::debug!(actor = %actor, error = %e, "Display name lookup failed");
                actor.to_string()
            }
        }
    }

    /// Copy a committed instance entry into the global log.
    ///
    /// The instance trail is already durable, so a failure here is logged
    /// rather than surfaced to the caller.
    pub(crate) async fn mirror(&self, instance: &ApprovalInstance, entry: &AuditEntry) {
        let event = AuditAppend {
            timestamp: entry.timestamp,
            actor: entry.actor_id.to_string(),
            action: entry.action.to_string(),
            instance_id: Some(instance.id.clone()),
            workflow_id: Some(instance.workflow_id.clone()),
            payload: serde_json::json!({
                "entry_id": entry.id,
                "sequence": entry.sequence,
                "actor_display_name": entry.actor_display_name,
                "workflow_version": instance.workflow_version,
                "record": instance.record,
                "details": entry.details,
            }),
        };
        let storage = &self.storage;
        let result = with_retry(&self.retry, "append_audit", || {
            storage.append_audit(event.clone())
        })
        .await;
        if let Err(e) = result {
            tracing::error!(
                instance_id = %instance.id,
                sequence = entry.sequence,
                error = %e,
                "Failed to mirror audit entry to compliance log"
            );
        }
    }

    /// Global log, newest first
    pub async fn list(&self, window: QueryWindow) -> ApprovalResult<Vec<AuditRecord>> {
        let storage = &self.storage;
        with_retry(&self.retry, "list_audit", || storage.list_audit(window))
            .await
            .map_err(storage_error)
    }

    /// Global log entries for one instance, oldest first
    pub async fn for_instance(&self, instance_id: &InstanceId) -> ApprovalResult<Vec<AuditRecord>> {
        let storage = &self.storage;
        with_retry(&self.retry, "list_audit_for_instance", || {
            storage.list_audit_for_instance(instance_id)
        })
        .await
        .map_err(storage_error)
    }

    /// Whether the whole global log still forms an unbroken hash chain
    pub async fn verify(&self) -> ApprovalResult<bool> {
        let mut records = self.list(QueryWindow::all()).await?;
        records.reverse();
        match verify_audit_chain(&records) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "Compliance audit chain verification failed");
                Ok(false)
            }
        }
    }
}
