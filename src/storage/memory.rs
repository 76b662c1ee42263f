// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process store implementations.
//!
//! [`InMemoryKvStore`] mirrors the Redis semantics the components rely on:
//! millisecond TTLs (expired lazily on access), sorted sets ordered by
//! `(score, member)`, big-endian bitmaps, and the [`AtomicScript`]s, which run
//! under a store-wide gate so they are atomic with respect to each other.
//!
//! [`InMemoryDurableStore`] is a `DashMap`-backed stand-in for the SQL store
//! with the same conditional-update and uniqueness behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::traits::{AtomicScript, DurableStore, KvStore, ScoredMember, StorageError};
use crate::model::{Blog, SeckillVoucher, Shop, VoucherOrder};

enum Value {
    Str(String),
    ZSet(HashMap<String, f64>),
    Bits(Vec<u8>),
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str) -> StorageError {
    StorageError::Backend(format!(
        "WRONGTYPE Operation against key '{}' holding the wrong kind of value",
        key
    ))
}

fn missing_operand(script: AtomicScript, what: &str) -> StorageError {
    StorageError::Backend(format!("script '{}' called without {}", script.name(), what))
}

pub struct InMemoryKvStore {
    data: DashMap<String, Slot>,
    script_gate: Mutex<()>,
}

impl InMemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            script_gate: Mutex::new(()),
        }
    }

    /// Number of keys, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining time to live, or `None` for persistent or missing keys.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.purge_expired(key);
        self.data
            .get(key)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.data.remove_if(key, |_, slot| slot.is_expired(now));
    }

    fn read_str(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.purge_expired(key);
        match self.data.get(key) {
            None => Ok(None),
            Some(slot) => match &slot.value {
                Value::Str(s) => Ok(Some(s.clone())),
                _ => Err(wrong_type(key)),
            },
        }
    }

    fn write_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Slot::new(Value::Str(value.to_string()), Some(ttl)));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(Value::Str(value.to_string()), Some(ttl)));
                true
            }
        }
    }

    fn increment(&self, key: &str) -> Result<i64, StorageError> {
        self.purge_expired(key);
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Str("0".to_string()), None));
        match &mut slot.value {
            Value::Str(s) => {
                let current: i64 = s
                    .parse()
                    .map_err(|_| StorageError::Backend("ERR value is not an integer or out of range".into()))?;
                let next = current
                    .checked_add(1)
                    .ok_or_else(|| StorageError::Backend("ERR increment or decrement would overflow".into()))?;
                *s = next.to_string();
                Ok(next)
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn run_script(&self, script: AtomicScript, keys: &[String], args: &[String]) -> Result<i64, StorageError> {
        let _gate = self.script_gate.lock();
        match script {
            AtomicScript::UnlockIfOwner => {
                let key = keys.first().ok_or_else(|| missing_operand(script, "a lock key"))?;
                let token = args.first().ok_or_else(|| missing_operand(script, "a holder token"))?;
                self.purge_expired(key);
                let removed = self
                    .data
                    .remove_if(key, |_, slot| matches!(&slot.value, Value::Str(held) if held == token));
                Ok(i64::from(removed.is_some()))
            }
            AtomicScript::SeckillAdmit => {
                let (stock_key, marker_key) = match keys {
                    [stock, marker, ..] => (stock, marker),
                    _ => return Err(missing_operand(script, "stock and marker keys")),
                };
                let user = args.first().ok_or_else(|| missing_operand(script, "a user id"))?;

                let stock = self.read_str(stock_key)?.and_then(|s| s.parse::<i64>().ok());
                let stock = match stock {
                    Some(n) if n > 0 => n,
                    _ => return Ok(1),
                };
                if self.read_str(marker_key)?.is_some() {
                    return Ok(2);
                }

                // Keeps whatever TTL the stock key carries.
                if let Some(mut slot) = self.data.get_mut(stock_key.as_str()) {
                    slot.value = Value::Str((stock - 1).to_string());
                }
                self.data
                    .insert(marker_key.clone(), Slot::new(Value::Str(user.clone()), None));
                Ok(0)
            }
        }
    }

    fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<bool, StorageError> {
        self.purge_expired(key);
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::ZSet(HashMap::new()), None));
        match &mut slot.value {
            Value::ZSet(members) => Ok(members.insert(member.to_string(), score).is_none()),
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        self.purge_expired(key);
        let removed = match self.data.get_mut(key) {
            None => return Ok(false),
            Some(mut slot) => match &mut slot.value {
                Value::ZSet(members) => members.remove(member).is_some(),
                _ => return Err(wrong_type(key)),
            },
        };
        // Redis drops empty sorted sets.
        self.data
            .remove_if(key, |_, slot| matches!(&slot.value, Value::ZSet(m) if m.is_empty()));
        Ok(removed)
    }

    /// Members ordered by ascending `(score, member)`.
    fn sorted_members(&self, key: &str) -> Result<Vec<(String, f64)>, StorageError> {
        self.purge_expired(key);
        let mut members: Vec<(String, f64)> = match self.data.get(key) {
            None => return Ok(Vec::new()),
            Some(slot) => match &slot.value {
                Value::ZSet(m) => m.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                _ => return Err(wrong_type(key)),
            },
        };
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    fn sorted_score(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        self.purge_expired(key);
        match self.data.get(key) {
            None => Ok(None),
            Some(slot) => match &slot.value {
                Value::ZSet(m) => Ok(m.get(member).copied()),
                _ => Err(wrong_type(key)),
            },
        }
    }

    fn write_bit(&self, key: &str, offset: u64, value: bool) -> Result<bool, StorageError> {
        self.purge_expired(key);
        let byte = usize::try_from(offset / 8)
            .map_err(|_| StorageError::Backend("ERR bit offset is not an integer or out of range".into()))?;
        let mask = 0x80u8 >> (offset % 8);
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Bits(Vec::new()), None));
        match &mut slot.value {
            Value::Bits(bits) => {
                if bits.len() <= byte {
                    bits.resize(byte + 1, 0);
                }
                let previous = bits[byte] & mask != 0;
                if value {
                    bits[byte] |= mask;
                } else {
                    bits[byte] &= !mask;
                }
                Ok(previous)
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn read_bitfield(&self, key: &str, width: u8, offset: u64) -> Result<u64, StorageError> {
        if !(1..=63).contains(&width) {
            return Err(StorageError::Backend(format!("ERR Invalid bitfield type u{}", width)));
        }
        self.purge_expired(key);
        let slot = match self.data.get(key) {
            None => return Ok(0),
            Some(slot) => slot,
        };
        let bits = match &slot.value {
            Value::Bits(bits) => bits,
            _ => return Err(wrong_type(key)),
        };
        let mut acc = 0u64;
        for position in offset..offset + u64::from(width) {
            let bit = usize::try_from(position / 8)
                .ok()
                .and_then(|byte| bits.get(byte))
                .map(|byte| byte & (0x80u8 >> (position % 8)) != 0)
                .unwrap_or(false);
            acc = (acc << 1) | u64::from(bit);
        }
        Ok(acc)
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.read_str(key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        self.data
            .insert(key.to_string(), Slot::new(Value::Str(value.to_string()), ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        Ok(self.write_if_absent(key, value, ttl))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.purge_expired(key);
        Ok(self.data.remove(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        self.increment(key)
    }

    async fn execute_atomic(
        &self,
        script: AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StorageError> {
        self.run_script(script, keys, args)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StorageError> {
        self.sorted_add(key, member, score)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        self.sorted_remove(key, member)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        self.sorted_score(key, member)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StorageError> {
        let members = self.sorted_members(key)?;
        let len = members.len() as isize;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(members[start as usize..=stop as usize]
            .iter()
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn zrevrange_by_score_with_scores(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        count: usize,
    ) -> Result<Vec<ScoredMember>, StorageError> {
        let members = self.sorted_members(key)?;
        Ok(members
            .into_iter()
            .rev()
            .filter(|(_, score)| *score <= max && *score >= min)
            .skip(offset)
            .take(count)
            .map(|(member, score)| ScoredMember::new(member, score))
            .collect())
    }

    async fn setbit(&self, key: &str, offset: u64, value: bool) -> Result<bool, StorageError> {
        self.write_bit(key, offset, value)
    }

    async fn bitfield_get_unsigned(&self, key: &str, width: u8, offset: u64) -> Result<u64, StorageError> {
        self.read_bitfield(key, width, offset)
    }
}

/// `DashMap`-backed [`DurableStore`].
pub struct InMemoryDurableStore {
    shops: DashMap<i64, Shop>,
    vouchers: DashMap<i64, SeckillVoucher>,
    orders: DashMap<(i64, i64), VoucherOrder>,
    /// `(user_id, follow_user_id)` → followed at
    follows: DashMap<(i64, i64), DateTime<Utc>>,
    blogs: DashMap<i64, Blog>,
    next_blog_id: AtomicI64,
}

impl InMemoryDurableStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shops: DashMap::new(),
            vouchers: DashMap::new(),
            orders: DashMap::new(),
            follows: DashMap::new(),
            blogs: DashMap::new(),
            next_blog_id: AtomicI64::new(1),
        }
    }

    /// Seed or replace a shop row.
    pub fn insert_shop(&self, shop: Shop) {
        self.shops.insert(shop.id, shop);
    }

    pub fn remove_shop(&self, id: i64) -> Option<Shop> {
        self.shops.remove(&id).map(|(_, shop)| shop)
    }

    #[must_use]
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    #[must_use]
    pub fn orders(&self) -> Vec<VoucherOrder> {
        self.orders.iter().map(|r| r.value().clone()).collect()
    }

    #[must_use]
    pub fn stock_of(&self, voucher_id: i64) -> Option<i32> {
        self.vouchers.get(&voucher_id).map(|v| v.stock)
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get_shop(&self, id: i64) -> Result<Option<Shop>, StorageError> {
        Ok(self.shops.get(&id).map(|r| r.value().clone()))
    }

    async fn update_shop(&self, shop: &Shop) -> Result<bool, StorageError> {
        match self.shops.get_mut(&shop.id) {
            Some(mut existing) => {
                *existing = shop.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_seckill_voucher(&self, voucher: &SeckillVoucher) -> Result<(), StorageError> {
        match self.vouchers.entry(voucher.voucher_id) {
            Entry::Occupied(_) => Err(StorageError::Duplicate(format!(
                "seckill voucher {}",
                voucher.voucher_id
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(voucher.clone());
                Ok(())
            }
        }
    }

    async fn get_seckill_voucher(&self, voucher_id: i64) -> Result<Option<SeckillVoucher>, StorageError> {
        Ok(self.vouchers.get(&voucher_id).map(|r| r.value().clone()))
    }

    async fn create_order_with_stock(&self, order: &VoucherOrder) -> Result<bool, StorageError> {
        // The order entry and the voucher stay locked until both writes land.
        // Nothing else takes these two locks in the opposite order.
        let slot = match self.orders.entry((order.user_id, order.voucher_id)) {
            Entry::Occupied(_) => {
                return Err(StorageError::Duplicate(format!(
                    "order for user {} voucher {}",
                    order.user_id, order.voucher_id
                )))
            }
            Entry::Vacant(vacant) => vacant,
        };
        let Some(mut voucher) = self.vouchers.get_mut(&order.voucher_id) else {
            return Ok(false);
        };
        if voucher.stock <= 0 {
            return Ok(false);
        }
        voucher.stock -= 1;
        slot.insert(order.clone());
        Ok(true)
    }

    async fn count_orders(&self, user_id: i64, voucher_id: i64) -> Result<u64, StorageError> {
        Ok(u64::from(self.orders.contains_key(&(user_id, voucher_id))))
    }

    async fn insert_follow(&self, user_id: i64, follow_user_id: i64) -> Result<(), StorageError> {
        match self.follows.entry((user_id, follow_user_id)) {
            Entry::Occupied(_) => Err(StorageError::Duplicate(format!(
                "follow {} -> {}",
                user_id, follow_user_id
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(Utc::now());
                Ok(())
            }
        }
    }

    async fn delete_follow(&self, user_id: i64, follow_user_id: i64) -> Result<bool, StorageError> {
        Ok(self.follows.remove(&(user_id, follow_user_id)).is_some())
    }

    async fn is_following(&self, user_id: i64, follow_user_id: i64) -> Result<bool, StorageError> {
        Ok(self.follows.contains_key(&(user_id, follow_user_id)))
    }

    async fn follower_ids(&self, author_id: i64) -> Result<Vec<i64>, StorageError> {
        let mut ids: Vec<i64> = self
            .follows
            .iter()
            .filter(|r| r.key().1 == author_id)
            .map(|r| r.key().0)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn followee_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        let mut ids: Vec<i64> = self
            .follows
            .iter()
            .filter(|r| r.key().0 == user_id)
            .map(|r| r.key().1)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn insert_blog(&self, blog: &Blog) -> Result<i64, StorageError> {
        let id = self.next_blog_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = blog.clone();
        stored.id = id;
        self.blogs.insert(id, stored);
        Ok(id)
    }

    async fn get_blog(&self, id: i64) -> Result<Option<Blog>, StorageError> {
        Ok(self.blogs.get(&id).map(|r| r.value().clone()))
    }

    async fn adjust_blog_likes(&self, id: i64, delta: i64) -> Result<bool, StorageError> {
        match self.blogs.get_mut(&id) {
            Some(mut blog) => {
                blog.liked += delta;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
