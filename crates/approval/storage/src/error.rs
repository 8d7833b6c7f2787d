use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The stored instance no longer matches the caller's guard
    #[error("compare-and-swap mismatch: {0}")]
    CasMismatch(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Only backend failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}
