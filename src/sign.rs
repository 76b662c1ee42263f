// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Daily sign-in bitmap: `sign:<user>:<yyyyMM>`, bit `day - 1` per day.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};

use crate::keys;
use crate::storage::traits::{KvStore, StorageError};

pub struct SignService {
    kv: Arc<dyn KvStore>,
}

impl SignService {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Mark `date` as signed. Returns true if it already was.
    pub async fn sign(&self, user_id: i64, date: NaiveDate) -> Result<bool, StorageError> {
        let key = keys::user_sign(user_id, &date.format("%Y%m").to_string());
        self.kv.setbit(&key, u64::from(date.day0()), true).await
    }

    /// Consecutive signed days ending on `date` within its month.
    pub async fn sign_streak(&self, user_id: i64, date: NaiveDate) -> Result<u32, StorageError> {
        let key = keys::user_sign(user_id, &date.format("%Y%m").to_string());
        // Day 1 is the most significant bit, `date` the least.
        let bits = self.kv.bitfield_get_unsigned(&key, date.day() as u8, 0).await?;
        Ok(bits.trailing_ones())
    }
}
