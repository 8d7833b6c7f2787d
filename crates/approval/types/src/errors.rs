//! Error types for the approval layer

use crate::{InstanceId, InstanceStatus, WorkflowId};
use rbac_types::UserId;
use serde::{Deserialize, Serialize};

/// Errors returned by approval operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Workflow {workflow_id} has no version {version}")]
    WorkflowVersionNotFound { workflow_id: WorkflowId, version: u32 },

    #[error("Approval instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Step {step_order} does not exist in workflow {workflow_id}")]
    StepNotFound { workflow_id: WorkflowId, step_order: u32 },

    #[error("Step {requested} is not the current step (current step is {current})")]
    WrongStep { requested: u32, current: u32 },

    #[error("Approval instance {instance_id} is already {status}")]
    InstanceAlreadyTerminal {
        instance_id: InstanceId,
        status: InstanceStatus,
    },

    #[error("Workflow is inactive: {0}")]
    WorkflowInactive(WorkflowId),

    #[error("User {actor} is not authorized: {reason}")]
    NotAuthorized { actor: UserId, reason: String },

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid delegation: {0}")]
    InvalidDelegation(String),

    /// Holds the contested resource, e.g. an instance id
    #[error("Concurrent modification of {0} could not be resolved")]
    ConcurrencyConflict(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Coarse error classification shared by every transport.
///
/// `NoEligibleApprovers` is never an error; it classifies the
/// [`InstanceCondition`](crate::InstanceCondition) of a stuck instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Unauthorized,
    NoEligibleApprovers,
    Validation,
    ConcurrencyConflict,
    StorageUnavailable,
}

impl ApprovalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WorkflowNotFound(_)
            | Self::WorkflowVersionNotFound { .. }
            | Self::InstanceNotFound(_)
            | Self::UserNotFound(_)
            | Self::StepNotFound { .. } => ErrorKind::NotFound,
            Self::WrongStep { .. }
            | Self::InstanceAlreadyTerminal { .. }
            | Self::WorkflowInactive(_) => ErrorKind::InvalidState,
            Self::NotAuthorized { .. } => ErrorKind::Unauthorized,
            Self::InvalidDefinition(_) | Self::InvalidDelegation(_) => ErrorKind::Validation,
            Self::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkflowNotFound(_) => "workflow_not_found",
            Self::WorkflowVersionNotFound { .. } => "workflow_version_not_found",
            Self::InstanceNotFound(_) => "instance_not_found",
            Self::UserNotFound(_) => "user_not_found",
            Self::StepNotFound { .. } => "step_not_found",
            Self::WrongStep { .. } => "wrong_step",
            Self::InstanceAlreadyTerminal { .. } => "instance_already_terminal",
            Self::WorkflowInactive(_) => "workflow_inactive",
            Self::NotAuthorized { .. } => "not_authorized",
            Self::InvalidDefinition(_) => "invalid_definition",
            Self::InvalidDelegation(_) => "invalid_delegation",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::StorageUnavailable(_) => "storage_unavailable",
        }
    }

    pub fn not_authorized(actor: &UserId, reason: impl Into<String>) -> Self {
        Self::NotAuthorized {
            actor: actor.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_invalid_state(&self) -> bool {
        self.kind() == ErrorKind::InvalidState
    }
}

/// Result type alias for approval operations
pub type ApprovalResult<T> = Result<T, ApprovalError>;
