// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deadline wrapper for external calls.
//!
//! A call that runs past its deadline is reported as
//! [`StorageError::Timeout`]. It may or may not have been applied remotely;
//! callers treat it as a failure and take their fallback path.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::storage::traits::StorageError;

/// Run `fut` with a deadline, mapping both expiry and the backend's own error
/// into [`StorageError`].
pub async fn with_timeout<F, T, E>(op: &str, after: Duration, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    deadline(op, after, async move {
        fut.await
            .map_err(|e| StorageError::Backend(format!("{}: {}", op, e)))
    })
    .await
}

/// Like [`with_timeout`] for futures that already speak [`StorageError`];
/// their errors pass through untouched.
pub async fn deadline<F, T>(op: &str, after: Duration, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => {
            debug!(op, ?after, "External call timed out");
            crate::metrics::record_error("store", op, "timeout");
            Err(StorageError::Timeout {
                op: op.to_string(),
                after,
            })
        }
    }
}
