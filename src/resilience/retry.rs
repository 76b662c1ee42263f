// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Only transient [`StorageError`]s (backend I/O, timeouts) are retried.
//! Duplicates, serialization failures and invariant breaches return
//! immediately: retrying them cannot change the outcome.
//!
//! Non-idempotent cache operations (`INCR`, `SET NX`, atomic scripts) must not
//! be wrapped in [`retry`]; a timed-out attempt may have been applied.
//!
//! # Example
//!
//! ```
//! use cache_guard::RetryConfig;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Query: quick retry, then fail
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, Some(3));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::storage::traits::StorageError;

/// Backoff schedule for a retried operation.
///
/// Use the presets:
/// - [`RetryConfig::startup()`] - connecting at process start
/// - [`RetryConfig::query()`] - idempotent reads and durable writes on the request path
/// - [`RetryConfig::background()`] - background writers that must eventually land
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first; `None` retries until success.
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// 5 attempts, roughly 3 seconds end to end. Surfaces a bad URL quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// 3 quick attempts; then the caller's fallback takes over.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    /// For the order writer: keep trying for about a minute before giving up on a record.
    #[must_use]
    pub fn background() -> Self {
        Self {
            max_retries: Some(10),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }

    /// Disables retrying.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_retries: Some(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

pub async fn retry<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                attempts += 1;
                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }

                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    error = %err,
                    next_in = ?delay,
                    "Transient failure, retrying"
                );

                sleep(delay).await;
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}
