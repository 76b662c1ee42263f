// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Non-blocking distributed mutex over the cache store.
//!
//! `try_lock` is a single `SET NX PX` with a holder token; `unlock` deletes
//! the key only while it still holds that token, as one atomic script.
//!
//! ```text
//! A: try_lock(1s) ─ ok ─────── (expires) ···············  unlock → no-op
//! B:                                  try_lock(1s) ─ ok ──────────────── held
//! ```
//!
//! A busy lock is `Ok(false)`, not an error. There is no blocking, waiting
//! or reentrancy; callers that want to retry do so themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::keys::LOCK_PREFIX;
use crate::storage::traits::{AtomicScript, KvStore, StorageError};

static PROCESS_ID: OnceLock<String> = OnceLock::new();
static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

fn process_id() -> &'static str {
    PROCESS_ID.get_or_init(|| Uuid::new_v4().simple().to_string())
}

/// A named lock handle. Each handle is a distinct holder: two handles on the
/// same name exclude each other even inside one task.
pub struct SimpleLock {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
}

impl SimpleLock {
    pub fn new(kv: Arc<dyn KvStore>, name: &str) -> Self {
        let holder = NEXT_HOLDER.fetch_add(1, Ordering::Relaxed);
        Self {
            kv,
            key: format!("{}{}", LOCK_PREFIX, name),
            token: format!("{}-{}", process_id(), holder),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// One acquisition attempt. `Ok(true)` iff the key was absent and now holds our token.
    pub async fn try_lock(&self, ttl: Duration) -> Result<bool, StorageError> {
        let acquired = self.kv.set_if_absent(&self.key, &self.token, ttl).await?;
        debug!(key = %self.key, acquired, "Lock attempt");
        crate::metrics::record_lock(if acquired { "acquired" } else { "contended" });
        Ok(acquired)
    }

    /// Release if still held by this handle. Returns whether a key was removed;
    /// releasing a lock we no longer own is a no-op.
    pub async fn unlock(&self) -> Result<bool, StorageError> {
        let removed = self
            .kv
            .execute_atomic(
                AtomicScript::UnlockIfOwner,
                std::slice::from_ref(&self.key),
                std::slice::from_ref(&self.token),
            )
            .await?;
        if removed == 1 {
            crate::metrics::record_lock("released");
            Ok(true)
        } else {
            debug!(key = %self.key, "Unlock skipped: lock expired or held by another owner");
            crate::metrics::record_lock("lost");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryKvStore;

    fn store() -> Arc<dyn KvStore> {
        Arc::new(InMemoryKvStore::new())
    }

    #[tokio::test]
    async fn test_second_holder_is_refused() {
        let kv = store();
        let a = SimpleLock::new(kv.clone(), "shop:1");
        let b = SimpleLock::new(kv.clone(), "shop:1");

        assert!(a.try_lock(Duration::from_secs(10)).await.unwrap());
        assert!(!b.try_lock(Duration::from_secs(10)).await.unwrap());
        assert!(a.unlock().await.unwrap());
        assert!(b.try_lock(Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_tokens_are_unique_per_handle() {
        let kv = store();
        let a = SimpleLock::new(kv.clone(), "x");
        let b = SimpleLock::new(kv, "x");
        assert_ne!(a.token(), b.token());
        assert_eq!(a.key(), "lock:x");
    }

    #[tokio::test]
    async fn test_foreign_unlock_is_noop() {
        let kv = store();
        let owner = SimpleLock::new(kv.clone(), "order:7");
        let intruder = SimpleLock::new(kv.clone(), "order:7");

        assert!(owner.try_lock(Duration::from_secs(10)).await.unwrap());
        assert!(!intruder.unlock().await.unwrap());
        assert_eq!(kv.get("lock:order:7").await.unwrap().as_deref(), Some(owner.token()));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_releasing_a_lost_lock_logs_below_warn() {
        let logs = CapturedLogs::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || sink.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let lock = SimpleLock::new(store(), "shop:3");
        assert!(!lock.unlock().await.unwrap());
        assert!(logs.0.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_holder_cannot_release_successor() {
        let kv = store();
        let a = SimpleLock::new(kv.clone(), "shop:9");
        let b = SimpleLock::new(kv.clone(), "shop:9");

        assert!(a.try_lock(Duration::from_secs(1)).await.unwrap());
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(b.try_lock(Duration::from_secs(1)).await.unwrap());

        assert!(!a.unlock().await.unwrap());
        assert_eq!(kv.get("lock:shop:9").await.unwrap().as_deref(), Some(b.token()));
    }
}
