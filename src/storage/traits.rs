// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store contracts consumed by every component.
//!
//! - [`KvStore`]: the shared cache (Redis in production). Single round-trip
//!   operations, any of which may fail transiently.
//! - [`DurableStore`]: the relational ground truth. Point lookups by primary
//!   key, one conditional decrement, and a `(user_id, voucher_id)` uniqueness
//!   guard on orders.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Blog, SeckillVoucher, Shop, VoucherOrder};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Operation '{op}' timed out after {after:?}")]
    Timeout { op: String, after: Duration },
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// A uniqueness constraint rejected the write.
    #[error("Duplicate record: {0}")]
    Duplicate(String),
    /// A state that atomicity should have made impossible. Never retried.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl StorageError {
    /// Whether a retry could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// One `member → score` pair returned from a sorted-set range.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

impl ScoredMember {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self { member: member.into(), score }
    }
}

/// Multi-step check-and-act operations that must run atomically inside the
/// cache store.
///
/// Redis runs the Lua source server-side; the in-memory store interprets the
/// same contract natively. Both return a small integer status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicScript {
    /// `KEYS[1]` = lock key, `ARGV[1]` = holder token.
    /// Deletes the key only if it still holds the token. Returns 1 if deleted, 0 otherwise.
    UnlockIfOwner,
    /// `KEYS[1]` = stock counter, `KEYS[2]` = admission marker, `ARGV[1]` = user id.
    /// Returns 0 (admitted: stock decremented, marker written), 1 (no stock) or 2 (duplicate).
    SeckillAdmit,
}

impl AtomicScript {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::UnlockIfOwner => "unlock_if_owner",
            Self::SeckillAdmit => "seckill_admit",
        }
    }

    /// Lua source for server-side execution.
    #[must_use]
    pub fn lua(&self) -> &'static str {
        match self {
            Self::UnlockIfOwner => UNLOCK_IF_OWNER_LUA,
            Self::SeckillAdmit => SECKILL_ADMIT_LUA,
        }
    }
}

const UNLOCK_IF_OWNER_LUA: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
"#;

const SECKILL_ADMIT_LUA: &str = r#"
local stock = tonumber(redis.call('get', KEYS[1]))
if stock == nil or stock <= 0 then
    return 1
end
if redis.call('exists', KEYS[2]) == 1 then
    return 2
end
redis.call('incrby', KEYS[1], -1)
redis.call('set', KEYS[2], ARGV[1])
return 0
"#;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// `SET key value [PX ttl]`. `None` keeps the key until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// `SET key value NX PX ttl`. True iff the key was absent and is now set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Returns true if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// `INCR`; creates the key at 1 when absent.
    async fn incr(&self, key: &str) -> Result<i64, StorageError>;

    async fn execute_atomic(
        &self,
        script: AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StorageError>;

    /// Returns true if the member was newly added.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StorageError>;

    /// Returns true if the member was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StorageError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError>;

    /// `ZRANGE key start stop` by ascending score. Negative indexes count from the end.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StorageError>;

    /// `ZREVRANGEBYSCORE key max min WITHSCORES LIMIT offset count`.
    async fn zrevrange_by_score_with_scores(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        count: usize,
    ) -> Result<Vec<ScoredMember>, StorageError>;

    /// Returns the previous bit value.
    async fn setbit(&self, key: &str, offset: u64, value: bool) -> Result<bool, StorageError>;

    /// `BITFIELD key GET u<width> offset`. Width is 1..=63.
    async fn bitfield_get_unsigned(&self, key: &str, width: u8, offset: u64) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_shop(&self, id: i64) -> Result<Option<Shop>, StorageError>;

    /// Returns false when no row matched.
    async fn update_shop(&self, shop: &Shop) -> Result<bool, StorageError>;

    async fn insert_seckill_voucher(&self, voucher: &SeckillVoucher) -> Result<(), StorageError>;

    async fn get_seckill_voucher(&self, voucher_id: i64) -> Result<Option<SeckillVoucher>, StorageError>;

    /// `UPDATE ... SET stock = stock - 1 WHERE voucher_id = ? AND stock > 0`
    /// and insert `order`, as one all-or-nothing write.
    ///
    /// Returns `Ok(false)` with nothing written when no stock is left, and
    /// [`StorageError::Duplicate`] with the stock untouched when the
    /// `(user_id, voucher_id)` pair already has an order.
    async fn create_order_with_stock(&self, order: &VoucherOrder) -> Result<bool, StorageError>;

    async fn count_orders(&self, user_id: i64, voucher_id: i64) -> Result<u64, StorageError>;

    /// Fails with [`StorageError::Duplicate`] if the edge exists.
    async fn insert_follow(&self, user_id: i64, follow_user_id: i64) -> Result<(), StorageError>;

    async fn delete_follow(&self, user_id: i64, follow_user_id: i64) -> Result<bool, StorageError>;

    async fn is_following(&self, user_id: i64, follow_user_id: i64) -> Result<bool, StorageError>;

    /// Users following `author_id`.
    async fn follower_ids(&self, author_id: i64) -> Result<Vec<i64>, StorageError>;

    /// Users that `user_id` follows.
    async fn followee_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError>;

    /// Returns the assigned blog id.
    async fn insert_blog(&self, blog: &Blog) -> Result<i64, StorageError>;

    async fn get_blog(&self, id: i64) -> Result<Option<Blog>, StorageError>;

    async fn adjust_blog_likes(&self, id: i64, delta: i64) -> Result<bool, StorageError>;
}
