//! Approval storage abstractions.
//!
//! This crate defines the persistence contract the approval engine needs:
//! - immutable, versioned workflow definitions
//! - approval instances guarded by compare-and-swap
//! - an append-only, hash-chained compliance audit log
//!
//! `InMemoryApprovalStorage` is the default adapter. The `postgres` feature
//! adds `PostgresApprovalStorage`.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryApprovalStorage;
pub use model::{compute_audit_hash, verify_audit_chain, AuditAppend, AuditRecord, CasGuard};
#[cfg(feature = "postgres")]
pub use postgres::PostgresApprovalStorage;
pub use traits::{apply_window, ApprovalStorage, AuditStore, InstanceStore, QueryWindow, WorkflowStore};
