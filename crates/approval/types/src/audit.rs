//! Per-instance audit entries

use crate::AuditEntryId;
use chrono::{DateTime, Utc};
use rbac_types::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Actor id recorded for engine-initiated changes such as escalation
pub const SYSTEM_ACTOR: &str = "system";

/// What happened to the instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Approved,
    Rejected,
    Cancelled,
    Delegated,
    Escalated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Delegated => "delegated",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    /// 1-based, contiguous within an instance
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor_id: UserId,
    pub actor_display_name: String,
    pub action: AuditAction,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn is_system(&self) -> bool {
        self.actor_id.as_str() == SYSTEM_ACTOR
    }
}
