use crate::{InstanceId, InstanceStatus};
use rbac_types::UserId;
use serde::{Deserialize, Serialize};

/// Notifications emitted after a transition commits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ApprovalEvent {
    #[serde(rename = "approval.step.opened")]
    StepOpened {
        instance_id: InstanceId,
        step_order: u32,
        eligible: Vec<UserId>,
    },
    #[serde(rename = "approval.completed")]
    Completed {
        instance_id: InstanceId,
        status: InstanceStatus,
    },
}

impl ApprovalEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StepOpened { .. } => "approval.step.opened",
            Self::Completed { .. } => "approval.completed",
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::StepOpened { instance_id, .. } | Self::Completed { instance_id, .. } => {
                instance_id
            }
        }
    }
}
