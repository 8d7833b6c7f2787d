use crate::{StorageError, StorageResult};
use approval_types::{ApprovalInstance, InstanceId, InstanceStatus, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Expected state of a stored instance for a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasGuard {
    pub revision: u64,
    pub status: InstanceStatus,
    pub current_step: u32,
}

impl CasGuard {
    pub fn of(instance: &ApprovalInstance) -> Self {
        Self {
            revision: instance.revision,
            status: instance.status,
            current_step: instance.current_step,
        }
    }

    pub fn matches(&self, instance: &ApprovalInstance) -> bool {
        *self == Self::of(instance)
    }
}

/// Audit append payload. Hashes and sequencing are assigned by storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditAppend {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub instance_id: Option<InstanceId>,
    pub workflow_id: Option<WorkflowId>,
    #[serde(default)]
    pub payload: Value,
}

/// Persistent tamper-evident audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub instance_id: Option<InstanceId>,
    pub workflow_id: Option<WorkflowId>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub hash: String,
}

impl AuditRecord {
    pub(crate) fn from_append(
        event: AuditAppend,
        event_id: String,
        sequence: u64,
        previous_hash: Option<String>,
        hash: String,
    ) -> Self {
        Self {
            event_id,
            sequence,
            timestamp: event.timestamp,
            actor: event.actor,
            action: event.action,
            instance_id: event.instance_id,
            workflow_id: event.workflow_id,
            payload: event.payload,
            previous_hash,
            hash,
        }
    }

    fn as_append(&self) -> AuditAppend {
        AuditAppend {
            timestamp: self.timestamp,
            actor: self.actor.clone(),
            action: self.action.clone(),
            instance_id: self.instance_id.clone(),
            workflow_id: self.workflow_id.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// blake3 over the canonical JSON of an event, its sequence and its predecessor's hash.
pub fn compute_audit_hash(
    event: &AuditAppend,
    previous_hash: Option<&str>,
    sequence: u64,
) -> StorageResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": previous_hash,
        "sequence": sequence,
        "timestamp": event.timestamp,
        "actor": event.actor,
        "action": event.action,
        "instance_id": event.instance_id.as_ref().map(|id| id.0.clone()),
        "workflow_id": event.workflow_id.as_ref().map(|id| id.0.clone()),
        "payload": event.payload,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

/// Check that records (oldest first) form an unbroken hash chain.
pub fn verify_audit_chain(records: &[AuditRecord]) -> StorageResult<()> {
    let mut previous: Option<&AuditRecord> = None;
    for record in records {
        let expected_sequence = previous.map(|p| p.sequence + 1).unwrap_or(record.sequence);
        if record.sequence != expected_sequence {
            return Err(StorageError::InvalidInput(format!(
                "audit sequence gap at {}",
                record.sequence
            )));
        }
        if let Some(p) = previous {
            if record.previous_hash.as_deref() != Some(p.hash.as_str()) {
                return Err(StorageError::InvalidInput(format!(
                    "audit chain broken at sequence {}",
                    record.sequence
                )));
            }
        }
        let hash = compute_audit_hash(
            &record.as_append(),
            record.previous_hash.as_deref(),
            record.sequence,
        )?;
        if hash != record.hash {
            return Err(StorageError::InvalidInput(format!(
                "audit hash mismatch at sequence {}",
                record.sequence
            )));
        }
        previous = Some(record);
    }
    Ok(())
}
