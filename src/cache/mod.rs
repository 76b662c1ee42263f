// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-aside loaders over the shared cache store.
//!
//! Two read strategies share one [`CacheClient`]:
//!
//! - **Pass-through** ([`CacheClient::query_with_pass_through`]): classic
//!   cache-aside with a physical TTL. A durable miss is remembered as the
//!   [`CACHE_NULL`] sentinel for a short TTL so repeated lookups of missing ids
//!   never reach the durable store.
//! - **Logical expiry** ([`CacheClient::query_with_logical_expire`]): for
//!   pre-warmed hot keys. Values live in a [`LogicalEnvelope`] without a
//!   physical TTL; once the embedded deadline passes, one caller wins the
//!   rebuild lock and schedules a refresh on the [`RebuildPool`] while every
//!   caller, including the winner, gets the stale value.
//!
//! Neither loader ever returns the sentinel; callers see a value or `None`.

mod logical_expire;
mod pass_through;
pub mod rebuild_pool;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::traits::{KvStore, StorageError};

pub use rebuild_pool::RebuildPool;

/// Cached marker for "the durable store has no such row".
pub const CACHE_NULL: &str = "";

/// A value with an application-level expiry, stored without a physical TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalEnvelope<T> {
    pub data: T,
    pub expire_time: DateTime<Utc>,
}

impl<T> LogicalEnvelope<T> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time <= now
    }
}

pub struct CacheClient {
    kv: Arc<dyn KvStore>,
    pool: Arc<RebuildPool>,
    null_ttl: Duration,
    lock_ttl: Duration,
}

impl CacheClient {
    pub fn new(kv: Arc<dyn KvStore>, pool: Arc<RebuildPool>, null_ttl: Duration, lock_ttl: Duration) -> Self {
        Self {
            kv,
            pool,
            null_ttl,
            lock_ttl,
        }
    }

    pub fn pool(&self) -> &Arc<RebuildPool> {
        &self.pool
    }

    /// Serialize `value` as JSON and store it with a physical TTL.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        self.kv.set(key, &json, Some(ttl)).await
    }

    /// Store `value` in a logical envelope expiring `expire` from now.
    pub async fn set_with_logical_expire<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expire: Duration,
    ) -> Result<(), StorageError> {
        write_envelope(self.kv.as_ref(), key, value, expire_at(expire)).await
    }

    /// Store `value` in a logical envelope with an explicit deadline.
    pub async fn set_logical_envelope<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expire_time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        write_envelope(self.kv.as_ref(), key, value, expire_time).await
    }

    /// Read an envelope without triggering a rebuild.
    pub async fn peek_envelope<T: DeserializeOwned>(&self, key: &str) -> Result<Option<LogicalEnvelope<T>>, StorageError> {
        match self.kv.get(key).await? {
            None => Ok(None),
            Some(raw) if raw == CACHE_NULL => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }
}

pub(crate) fn expire_at(after: Duration) -> DateTime<Utc> {
    let after = chrono::Duration::from_std(after).unwrap_or(chrono::Duration::MAX);
    Utc::now().checked_add_signed(after).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) async fn write_envelope<T: Serialize>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
    expire_time: DateTime<Utc>,
) -> Result<(), StorageError> {
    let json = serde_json::to_string(&LogicalEnvelope { data: value, expire_time })?;
    kv.set(key, &json, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Shop;
    use crate::storage::memory::InMemoryKvStore;

    #[tokio::test]
    async fn test_envelope_wire_shape() {
        let kv = Arc::new(InMemoryKvStore::new());
        let client = CacheClient::new(
            kv.clone(),
            Arc::new(RebuildPool::new(1)),
            Duration::from_secs(120),
            Duration::from_secs(10),
        );
        client
            .set_with_logical_expire("cache:shop:1", &Shop::new(1, "Tea House"), Duration::from_secs(60))
            .await
            .unwrap();

        let raw = kv.get("cache:shop:1").await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["data"]["name"], "Tea House");
        assert!(json["expireTime"].is_string());
        assert!(kv.ttl("cache:shop:1").is_none());

        let envelope: LogicalEnvelope<Shop> = client.peek_envelope("cache:shop:1").await.unwrap().unwrap();
        assert!(!envelope.is_expired(Utc::now()));
    }

    #[test]
    fn test_expire_at_saturates() {
        assert_eq!(expire_at(Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
