//! Read models returned by engine operations

use crate::{ApprovalInstance, ErrorKind, InstanceId, InstanceStatus};
use chrono::{DateTime, Utc};
use rbac_types::UserId;
use serde::{Deserialize, Serialize};

/// Result of starting an approval
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedApproval {
    pub instance_id: InstanceId,
    pub current_step: u32,
    pub status: InstanceStatus,
    /// Live eligible set of step 1 at start time
    pub eligible_approvers: Vec<UserId>,
}

impl StartedApproval {
    /// Nobody can act on step 1
    pub fn is_stuck(&self) -> bool {
        self.eligible_approvers.is_empty()
    }
}

/// Non-fatal condition surfaced alongside an instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum InstanceCondition {
    /// The open step currently resolves to an empty approver set
    NoEligibleApprovers { step_order: u32 },
}

impl InstanceCondition {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoEligibleApprovers { .. } => ErrorKind::NoEligibleApprovers,
        }
    }

    /// Stable machine-readable code, same namespace as error codes
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoEligibleApprovers { .. } => "no_eligible_approvers",
        }
    }
}

/// An instance together with the live approver set of its open step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub instance: ApprovalInstance,
    /// Empty once the instance is terminal
    pub eligible_approvers: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<InstanceCondition>,
}

impl InstanceView {
    pub fn new(instance: ApprovalInstance, eligible_approvers: Vec<UserId>) -> Self {
        let condition = if !instance.is_terminal() && eligible_approvers.is_empty() {
            Some(InstanceCondition::NoEligibleApprovers {
                step_order: instance.current_step,
            })
        } else {
            None
        };
        Self {
            instance,
            eligible_approvers,
            condition,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.instance.id
    }

    pub fn status(&self) -> InstanceStatus {
        self.instance.status
    }

    pub fn is_stuck(&self) -> bool {
        self.condition.is_some()
    }
}

/// An open step past its escalation timeout
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationCandidate {
    pub instance_id: InstanceId,
    pub step_order: u32,
    pub opened_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub escalation_count: u32,
}
