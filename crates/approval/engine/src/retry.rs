//! Storage retry and error mapping

use crate::config::RetryPolicy;
use approval_storage::{StorageError, StorageResult};
use approval_types::ApprovalError;
use rbac_identity::IdentityError;
use std::future::Future;

/// Run a storage call, retrying transient failures with backoff.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient storage failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Map a storage error that the caller did not handle itself
pub(crate) fn storage_error(err: StorageError) -> ApprovalError {
    match err {
        StorageError::Backend(msg) => ApprovalError::StorageUnavailable(msg),
        other => ApprovalError::StorageUnavailable(other.to_string()),
    }
}

pub(crate) fn identity_error(err: IdentityError) -> ApprovalError {
    ApprovalError::StorageUnavailable(format!("identity store: {err}"))
}
