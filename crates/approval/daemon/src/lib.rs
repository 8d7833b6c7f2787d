//! Approval daemon library
//!
//! Hosts the approval engine behind a REST API:
//! - Workflow definition and instance endpoints
//! - Identity administration over the in-memory identity store
//! - Escalation sweeper for steps past their timeout
//! - Server lifecycle management

#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod error;
pub mod server;
pub mod sweeper;

pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError, DaemonResult};
pub use server::Server;
pub use sweeper::EscalationSweeper;
