//! Approval Types - the data model of multi-step approval workflows
//!
//! An [`ApprovalWorkflow`] is an immutable, versioned sequence of
//! [`WorkflowStep`]s. Starting one against a business record creates an
//! [`ApprovalInstance`] pinned to that version, which advances one step at
//! a time as approvers act. Every state change appends an [`AuditEntry`].

#![deny(unsafe_code)]

mod audit;
mod definition;
mod errors;
mod event;
mod ids;
mod instance;
mod view;

pub use audit::{AuditAction, AuditEntry, SYSTEM_ACTOR};
pub use definition::{ApprovalWorkflow, WorkflowDraft, WorkflowStep, MAX_ESCALATION_TIMEOUT_SECS};
pub use errors::{ApprovalError, ApprovalResult, ErrorKind};
pub use event::ApprovalEvent;
pub use ids::{AuditEntryId, InstanceId, RecordRef, WorkflowId};
pub use instance::{ApprovalInstance, Decision, InstanceStatus, StepExecutionRecord, StepStatus};
pub use view::{EscalationCandidate, InstanceCondition, InstanceView, StartedApproval};

pub use rbac_types::{RoleName, UserId};
