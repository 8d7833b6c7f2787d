//! Approval Engine - sequential multi-step approvals with RBAC step resolution
//!
//! The engine drives [`ApprovalInstance`](approval_types::ApprovalInstance)s
//! through the steps of a pinned workflow version:
//!
//! - **Definition registry**: versioned workflow definitions, cached per version
//! - **Step resolver**: live eligible approver sets from users, roles and groups
//! - **Instance engine**: start, act, cancel, with compare-and-swap commits
//! - **Escalation/delegation**: advisory hand-offs and timeout flags
//! - **Audit trail**: per-instance entries mirrored into a hash-chained log
//!
//! Identity data is read fresh on every decision, so role and membership
//! changes apply to steps that are still open.

#![deny(unsafe_code)]

mod audit_trail;
mod config;
mod definition_registry;
mod engine;
mod escalation;
mod notifier;
mod retry;
mod step_resolver;

pub use audit_trail::AuditTrail;
pub use config::{EngineConfig, RetryPolicy};
pub use definition_registry::DefinitionRegistry;
pub use engine::{ApprovalEngine, CANCEL_PERMISSION};
pub use notifier::{ApprovalNotifier, BroadcastNotifier, NoopNotifier};
pub use step_resolver::StepResolver;

pub use rbac_resolver::EffectiveAccess;
