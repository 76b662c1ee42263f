// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for [`KvStore`].
//!
//! Every call is one round trip on a shared [`ConnectionManager`] and carries
//! the store's operation deadline. Reads are retried with the query preset;
//! writes whose replay would change the outcome (`INCR`, `SET NX`, scripts)
//! are attempted exactly once.
//!
//! Atomic scripts are loaded as [`redis::Script`], which sends `EVALSHA` and
//! falls back to `EVAL` when the server has not cached the script yet.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client, Script};

use super::traits::{AtomicScript, KvStore, ScoredMember, StorageError};
use crate::resilience::retry::{retry, RetryConfig};
use crate::resilience::timeout::with_timeout;

pub struct RedisKvStore {
    connection: ConnectionManager,
    /// Optional namespace prepended to every key (e.g. "app:" → "app:feed:1")
    prefix: String,
    op_timeout: Duration,
    unlock_script: Script,
    admit_script: Script,
}

impl RedisKvStore {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str, op_timeout: Duration) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None, op_timeout).await
    }

    /// Connect with an optional key prefix.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use cache_guard::storage::redis::RedisKvStore;
    /// # use std::time::Duration;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys become "shop-app:cache:shop:1", "shop-app:feed:7", ...
    /// let store = RedisKvStore::with_prefix(
    ///     "redis://localhost",
    ///     Some("shop-app:"),
    ///     Duration::from_millis(500),
    /// ).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(
        connection_string: &str,
        prefix: Option<&str>,
        op_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || {
            let client = client.clone();
            async move {
                ConnectionManager::new(client)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            }
        })
        .await?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            op_timeout,
            unlock_script: Script::new(AtomicScript::UnlockIfOwner.lua()),
            admit_script: Script::new(AtomicScript::SeckillAdmit.lua()),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn script(&self, script: AtomicScript) -> &Script {
        match script {
            AtomicScript::UnlockIfOwner => &self.unlock_script,
            AtomicScript::SeckillAdmit => &self.admit_script,
        }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let key = self.prefixed_key(key);
        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            with_timeout("redis_get", self.op_timeout, async move {
                conn.get::<_, Option<String>>(&key).await
            })
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let key = self.prefixed_key(key);
        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let mut command = cmd("SET");
            command.arg(&key).arg(value);
            if let Some(ttl) = ttl {
                command.arg("PX").arg(ttl.as_millis().max(1) as u64);
            }
            with_timeout("redis_set", self.op_timeout, async move {
                command.query_async::<()>(&mut conn).await
            })
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let reply: Option<String> = with_timeout("redis_set_nx", self.op_timeout, async move {
            cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis().max(1) as u64)
                .query_async::<Option<String>>(&mut conn)
                .await
        })
        .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let key = self.prefixed_key(key);
        retry("redis_del", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            with_timeout("redis_del", self.op_timeout, async move {
                conn.del::<_, i64>(&key).await
            })
        })
        .await
        .map(|removed| removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        with_timeout("redis_incr", self.op_timeout, async move {
            conn.incr::<_, _, i64>(&key, 1).await
        })
        .await
    }

    async fn execute_atomic(
        &self,
        script: AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StorageError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.script(script).prepare_invoke();
        for key in keys {
            invocation.key(self.prefixed_key(key));
        }
        for arg in args {
            invocation.arg(arg);
        }
        with_timeout(script.name(), self.op_timeout, async move {
            invocation.invoke_async(&mut conn).await
        })
        .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StorageError> {
        let key = self.prefixed_key(key);
        retry("redis_zadd", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            with_timeout("redis_zadd", self.op_timeout, async move {
                conn.zadd::<_, _, _, i64>(&key, member, score).await
            })
        })
        .await
        .map(|added| added > 0)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let key = self.prefixed_key(key);
        retry("redis_zrem", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            with_timeout("redis_zrem", self.op_timeout, async move {
                conn.zrem::<_, _, i64>(&key, member).await
            })
        })
        .await
        .map(|removed| removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        let key = self.prefixed_key(key);
        retry("redis_zscore", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            with_timeout("redis_zscore", self.op_timeout, async move {
                conn.zscore::<_, _, Option<f64>>(&key, member).await
            })
        })
        .await
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StorageError> {
        let key = self.prefixed_key(key);
        retry("redis_zrange", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            with_timeout("redis_zrange", self.op_timeout, async move {
                conn.zrange::<_, Vec<String>>(&key, start, stop).await
            })
        })
        .await
    }

    async fn zrevrange_by_score_with_scores(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        count: usize,
    ) -> Result<Vec<ScoredMember>, StorageError> {
        let key = self.prefixed_key(key);
        let pairs: Vec<(String, f64)> = retry("redis_zrevrangebyscore", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            with_timeout("redis_zrevrangebyscore", self.op_timeout, async move {
                conn.zrevrangebyscore_limit_withscores::<_, _, _, Vec<(String, f64)>>(
                    &key,
                    max,
                    min,
                    offset as isize,
                    count as isize,
                )
                .await
            })
        })
        .await?;
        Ok(pairs
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect())
    }

    async fn setbit(&self, key: &str, offset: u64, value: bool) -> Result<bool, StorageError> {
        let key = self.prefixed_key(key);
        retry("redis_setbit", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            with_timeout("redis_setbit", self.op_timeout, async move {
                conn.setbit::<_, i64>(&key, offset as usize, value).await
            })
        })
        .await
        .map(|previous| previous == 1)
    }

    async fn bitfield_get_unsigned(&self, key: &str, width: u8, offset: u64) -> Result<u64, StorageError> {
        if !(1..=63).contains(&width) {
            return Err(StorageError::Backend(format!("ERR Invalid bitfield type u{}", width)));
        }
        let key = self.prefixed_key(key);
        let values: Vec<Option<i64>> = retry("redis_bitfield", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            with_timeout("redis_bitfield", self.op_timeout, async move {
                cmd("BITFIELD")
                    .arg(&key)
                    .arg("GET")
                    .arg(format!("u{}", width))
                    .arg(offset)
                    .query_async::<Vec<Option<i64>>>(&mut conn)
                    .await
            })
        })
        .await?;
        Ok(values.into_iter().next().flatten().unwrap_or(0).max(0) as u64)
    }
}
