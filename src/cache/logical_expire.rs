// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{expire_at, write_envelope, CacheClient, LogicalEnvelope, CACHE_NULL};
use crate::keys::rebuild_lock_name;
use crate::lock::SimpleLock;
use crate::storage::traits::{KvStore, StorageError};

impl CacheClient {
    /// Stale-while-revalidate read for pre-warmed hot keys.
    ///
    /// A cold key returns `None` without touching the durable store. A fresh
    /// envelope returns its value. An expired one returns the stale value
    /// right away; the caller that wins `lock:<entity><id>` schedules one
    /// background rebuild that reloads, rewrites the envelope with
    /// `expire_time = now + expire`, and releases the lock on every exit path.
    ///
    /// A cache read failure propagates; a failure to take or schedule the
    /// rebuild only costs freshness.
    pub async fn query_with_logical_expire<T, I, F, Fut>(
        &self,
        key_prefix: &str,
        id: I,
        expire: Duration,
        loader: F,
    ) -> Result<Option<T>, StorageError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        I: Display + Send + 'static,
        F: FnOnce(I) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, StorageError>> + Send + 'static,
    {
        let key = format!("{}{}", key_prefix, id);

        let Some(raw) = self.kv.get(&key).await? else {
            crate::metrics::record_cache_lookup(key_prefix, "cold");
            return Ok(None);
        };
        if raw == CACHE_NULL {
            crate::metrics::record_cache_lookup(key_prefix, "null_hit");
            return Ok(None);
        }

        let envelope: LogicalEnvelope<T> = serde_json::from_str(&raw).map_err(|e| {
            warn!(key = %key, error = %e, "Undecodable logical-expiry envelope");
            StorageError::from(e)
        })?;

        if !envelope.is_expired(Utc::now()) {
            crate::metrics::record_cache_lookup(key_prefix, "hit");
            return Ok(Some(envelope.data));
        }

        crate::metrics::record_cache_lookup(key_prefix, "stale");
        let lock = Arc::new(SimpleLock::new(
            self.kv.clone(),
            &rebuild_lock_name(key_prefix, &id.to_string()),
        ));

        match lock.try_lock(self.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %key, "Rebuild already in flight, serving stale");
                return Ok(Some(envelope.data));
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Rebuild lock unavailable, serving stale");
                return Ok(Some(envelope.data));
            }
        }

        // Another holder may have finished a rebuild between our read and our lock.
        if let Ok(Some(current)) = self.peek_envelope::<T>(&key).await {
            if !current.is_expired(Utc::now()) {
                release(&lock, &key).await;
                return Ok(Some(current.data));
            }
        }

        let job = rebuild(self.kv.clone(), lock.clone(), key.clone(), id, expire, loader);
        if let Err(e) = self.pool.submit(job) {
            warn!(key = %key, error = %e, "Rebuild not scheduled, serving stale");
            release(&lock, &key).await;
        }

        Ok(Some(envelope.data))
    }

    /// Load `id` now and write a fresh envelope. Used to pre-populate hot keys.
    pub async fn warm<T, I, F, Fut>(
        &self,
        key_prefix: &str,
        id: I,
        expire: Duration,
        loader: F,
    ) -> Result<bool, StorageError>
    where
        T: Serialize,
        I: Display,
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<Option<T>, StorageError>>,
    {
        let key = format!("{}{}", key_prefix, id);
        match loader(id).await? {
            Some(value) => {
                write_envelope(self.kv.as_ref(), &key, &value, expire_at(expire)).await?;
                info!(key = %key, ?expire, "Hot key warmed");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

async fn rebuild<T, I, F, Fut>(
    kv: Arc<dyn KvStore>,
    lock: Arc<SimpleLock>,
    key: String,
    id: I,
    expire: Duration,
    loader: F,
) where
    T: Serialize + Send + Sync + 'static,
    I: Send + 'static,
    F: FnOnce(I) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<T>, StorageError>> + Send + 'static,
{
    let writer = kv.clone();
    let target = key.clone();
    // Inner task so a panicking loader still reaches the unlock below.
    let outcome = tokio::spawn(async move {
        match loader(id).await? {
            Some(value) => write_envelope(writer.as_ref(), &target, &value, expire_at(expire)).await,
            None => writer.delete(&target).await.map(|_| ()),
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => {
            debug!(key = %key, "Rebuild complete");
            crate::metrics::record_rebuild("success");
        }
        Ok(Err(e)) => {
            warn!(key = %key, error = %e, "Rebuild failed, stale value kept");
            crate::metrics::record_rebuild("error");
        }
        Err(e) => {
            error!(key = %key, error = %e, "Rebuild task panicked");
            crate::metrics::record_rebuild("panic");
        }
    }

    release(&lock, &key).await;
}

async fn release(lock: &SimpleLock, key: &str) {
    if let Err(e) = lock.unlock().await {
        warn!(key = %key, lock = %lock.key(), error = %e, "Rebuild lock release failed; TTL will reclaim it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RebuildPool;
    use crate::model::Shop;
    use crate::storage::memory::InMemoryKvStore;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const EXPIRE: Duration = Duration::from_secs(1800);

    fn client(kv: Arc<InMemoryKvStore>) -> CacheClient {
        CacheClient::new(kv, Arc::new(RebuildPool::new(4)), Duration::from_secs(120), Duration::from_secs(10))
    }

    async fn seed_expired(client: &CacheClient, id: i64, name: &str) {
        client
            .set_logical_envelope(
                &format!("cache:shop:{}", id),
                &Shop::new(id, name),
                Utc::now() - ChronoDuration::seconds(5),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cold_key_returns_none_without_loading() {
        let kv = Arc::new(InMemoryKvStore::new());
        let client = client(kv);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let shop: Option<Shop> = client
            .query_with_logical_expire("cache:shop:", 1_i64, EXPIRE, move |id| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Some(Shop::new(id, "x"))) }
            })
            .await
            .unwrap();
        assert!(shop.is_none());
        client.pool().wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fresh_envelope_is_served() {
        let kv = Arc::new(InMemoryKvStore::new());
        let client = client(kv);
        assert!(client
            .warm("cache:shop:", 2_i64, EXPIRE, |id| async move { Ok(Some(Shop::new(id, "Fresh"))) })
            .await
            .unwrap());

        let shop: Option<Shop> = client
            .query_with_logical_expire("cache:shop:", 2_i64, EXPIRE, |_| async {
                Err(StorageError::Backend("must not load".into()))
            })
            .await
            .unwrap();
        assert_eq!(shop.unwrap().name, "Fresh");
    }

    #[tokio::test]
    async fn test_expired_serves_stale_then_refreshes() {
        let kv = Arc::new(InMemoryKvStore::new());
        let client = client(kv.clone());
        seed_expired(&client, 3, "Old").await;

        let shop: Option<Shop> = client
            .query_with_logical_expire("cache:shop:", 3_i64, EXPIRE, |id| async move {
                Ok(Some(Shop::new(id, "New")))
            })
            .await
            .unwrap();
        assert_eq!(shop.unwrap().name, "Old");

        client.pool().wait_idle().await;
        let envelope: LogicalEnvelope<Shop> = client.peek_envelope("cache:shop:3").await.unwrap().unwrap();
        assert_eq!(envelope.data.name, "New");
        assert!(!envelope.is_expired(Utc::now()));
        assert!(kv.get("lock:shop:3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_held_lock_means_no_rebuild() {
        let kv = Arc::new(InMemoryKvStore::new());
        let client = client(kv.clone());
        seed_expired(&client, 4, "Old").await;
        kv.set("lock:shop:4", "someone-else", Some(Duration::from_secs(10))).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let shop: Option<Shop> = client
            .query_with_logical_expire("cache:shop:", 4_i64, EXPIRE, move |id| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Some(Shop::new(id, "New"))) }
            })
            .await
            .unwrap();
        assert_eq!(shop.unwrap().name, "Old");
        client.pool().wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_rebuild_releases_lock_and_keeps_stale() {
        let kv = Arc::new(InMemoryKvStore::new());
        let client = client(kv.clone());
        seed_expired(&client, 5, "Old").await;

        let _: Option<Shop> = client
            .query_with_logical_expire("cache:shop:", 5_i64, EXPIRE, |_| async {
                Err(StorageError::Backend("db down".into()))
            })
            .await
            .unwrap();
        client.pool().wait_idle().await;

        assert!(kv.get("lock:shop:5").await.unwrap().is_none());
        let envelope: LogicalEnvelope<Shop> = client.peek_envelope("cache:shop:5").await.unwrap().unwrap();
        assert_eq!(envelope.data.name, "Old");
    }

    #[tokio::test]
    async fn test_panicking_loader_still_releases_lock() {
        let kv = Arc::new(InMemoryKvStore::new());
        let client = client(kv.clone());
        seed_expired(&client, 6, "Old").await;

        let _: Option<Shop> = client
            .query_with_logical_expire("cache:shop:", 6_i64, EXPIRE, |_| async {
                let explode = true;
                if explode {
                    panic!("loader bug");
                }
                Ok(None)
            })
            .await
            .unwrap();
        client.pool().wait_idle().await;
        assert!(kv.get("lock:shop:6").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vanished_row_clears_hot_key() {
        let kv = Arc::new(InMemoryKvStore::new());
        let client = client(kv.clone());
        seed_expired(&client, 7, "Closed").await;

        let _: Option<Shop> = client
            .query_with_logical_expire("cache:shop:", 7_i64, EXPIRE, |_| async { Ok(None) })
            .await
            .unwrap();
        client.pool().wait_idle().await;
        assert!(kv.get("cache:shop:7").await.unwrap().is_none());
    }
}
