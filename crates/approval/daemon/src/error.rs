//! Error types for the approval daemon

use approval_types::{ApprovalError, ErrorKind};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rbac_identity::IdentityError;
use serde::Serialize;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    /// Storage backend could not be opened
    #[error("Storage error: {0}")]
    Storage(String),

    /// Identity seed could not be loaded
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// API-specific errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Engine outcome
    #[error(transparent)]
    Approval(#[from] ApprovalError),

    /// Identity administration outcome
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Malformed request
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Approval(e) => match e.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::InvalidState | ErrorKind::ConcurrencyConflict => StatusCode::CONFLICT,
                ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
                ErrorKind::NoEligibleApprovers | ErrorKind::Validation => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                ErrorKind::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Identity(e) => match e {
                IdentityError::UserNotFound(_)
                | IdentityError::RoleNotFound(_)
                | IdentityError::GroupNotFound(_) => StatusCode::NOT_FOUND,
                IdentityError::DuplicateUser(_)
                | IdentityError::DuplicateRoleId(_)
                | IdentityError::DuplicateRole(_)
                | IdentityError::DuplicateGroup(_)
                | IdentityError::SystemRoleImmutable(_) => StatusCode::CONFLICT,
                IdentityError::InvalidSeed(_) => StatusCode::UNPROCESSABLE_ENTITY,
                IdentityError::Backend(_) | IdentityError::LockError => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Approval(e) => e.code(),
            ApiError::Identity(e) => match e {
                IdentityError::UserNotFound(_) => "user_not_found",
                IdentityError::RoleNotFound(_) => "role_not_found",
                IdentityError::GroupNotFound(_) => "group_not_found",
                IdentityError::DuplicateUser(_) => "duplicate_user",
                IdentityError::DuplicateRoleId(_) => "duplicate_role_id",
                IdentityError::DuplicateRole(_) => "duplicate_role",
                IdentityError::DuplicateGroup(_) => "duplicate_group",
                IdentityError::SystemRoleImmutable(_) => "system_role_immutable",
                IdentityError::InvalidSeed(_) => "invalid_seed",
                IdentityError::Backend(_) | IdentityError::LockError => "storage_unavailable",
            },
            ApiError::BadRequest(_) => "bad_request",
        }
    }

    /// Message safe to show callers; backend detail stays in the logs
    fn public_message(&self) -> String {
        if self.status() == StatusCode::SERVICE_UNAVAILABLE {
            "Storage unavailable".to_string()
        } else {
            self.to_string()
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self, "Request failed on storage");
        }

        let body = ErrorResponse {
            error: self.public_message(),
            code: self.code().to_string(),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
