// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Globally increasing 64-bit ids.
//!
//! ```text
//!  63 ............................ bits | bits-1 ............ 0
//! [ seconds since epoch              ] [ daily sequence       ]
//! ```
//!
//! The sequence comes from `INCR incr:<tag>:<yyyyMMdd>`, so it is collision
//! free per tag and day, and rotates at UTC midnight by key change. The
//! timestamp dominates the high bits, so ids from later days always compare
//! greater. The sequence width must cover a day's volume; overflow is logged,
//! not prevented.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::keys::ID_PREFIX;
use crate::storage::traits::{KvStore, StorageError};

pub struct IdWorker {
    kv: Arc<dyn KvStore>,
    epoch_secs: i64,
    sequence_bits: u32,
}

impl IdWorker {
    pub fn new(kv: Arc<dyn KvStore>, epoch_secs: i64, sequence_bits: u32) -> Self {
        Self {
            kv,
            epoch_secs,
            sequence_bits,
        }
    }

    pub async fn next_id(&self, tag: &str) -> Result<i64, StorageError> {
        self.next_id_at(tag, Utc::now()).await
    }

    /// Same as [`next_id`](Self::next_id) with an explicit clock reading.
    pub async fn next_id_at(&self, tag: &str, now: DateTime<Utc>) -> Result<i64, StorageError> {
        let timestamp = now.timestamp() - self.epoch_secs;
        if timestamp < 0 {
            return Err(StorageError::Invariant(format!(
                "clock {} is before id epoch {}",
                now.timestamp(),
                self.epoch_secs
            )));
        }

        let timestamp_bits = 63_u32.saturating_sub(self.sequence_bits);
        if timestamp >> timestamp_bits != 0 {
            return Err(StorageError::Invariant(format!(
                "{} seconds since id epoch do not fit in {} bits beside a {}-bit sequence",
                timestamp, timestamp_bits, self.sequence_bits
            )));
        }

        let key = format!("{}{}:{}", ID_PREFIX, tag, now.format("%Y%m%d"));
        let sequence = self.kv.incr(&key).await?;

        let mask = (1_i64 << self.sequence_bits) - 1;
        if sequence > mask {
            warn!(tag, sequence, bits = self.sequence_bits, "Daily id sequence overflowed its bit width");
        }

        crate::metrics::record_id_issued(tag);
        Ok((timestamp << self.sequence_bits) | (sequence & mask))
    }

    /// Split an id into `(seconds since epoch, sequence)`.
    pub fn decompose(&self, id: i64) -> (i64, i64) {
        let mask = (1_i64 << self.sequence_bits) - 1;
        (id >> self.sequence_bits, id & mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryKvStore;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn worker() -> IdWorker {
        IdWorker::new(Arc::new(InMemoryKvStore::new()), 1_640_995_200, 32)
    }

    #[tokio::test]
    async fn test_layout_and_sequence() {
        let worker = worker();
        let now = Utc.with_ymd_and_hms(2022, 1, 2, 0, 0, 0).unwrap();
        let first = worker.next_id_at("order", now).await.unwrap();
        let second = worker.next_id_at("order", now).await.unwrap();

        assert_eq!(worker.decompose(first), (86_400, 1));
        assert_eq!(worker.decompose(second), (86_400, 2));
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_tags_have_independent_sequences() {
        let worker = worker();
        let now = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap();
        let order = worker.next_id_at("order", now).await.unwrap();
        let blog = worker.next_id_at("blog", now).await.unwrap();
        assert_eq!(order, blog);
    }

    #[tokio::test]
    async fn test_later_day_beats_large_sequence() {
        let worker = worker();
        let day1 = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();

        let mut last_day1 = 0;
        for _ in 0..50 {
            last_day1 = worker.next_id_at("order", day1).await.unwrap();
        }
        let first_day2 = worker.next_id_at("order", day2).await.unwrap();
        assert!(first_day2 > last_day1);
        assert_eq!(worker.decompose(first_day2).1, 1);
    }

    #[tokio::test]
    async fn test_clock_before_epoch_is_rejected() {
        let worker = worker();
        let early = Utc.with_ymd_and_hms(2021, 12, 31, 0, 0, 0).unwrap();
        assert!(matches!(
            worker.next_id_at("order", early).await,
            Err(StorageError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn test_timestamp_past_its_bit_width_is_rejected() {
        // 40 sequence bits leave 23 for seconds: about 97 days past the epoch.
        let worker = IdWorker::new(Arc::new(InMemoryKvStore::new()), 1_640_995_200, 40);
        let early = Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap();
        let id = worker.next_id_at("order", early).await.unwrap();
        assert!(id > 0);

        let late = Utc.with_ymd_and_hms(2024, 5, 24, 0, 0, 0).unwrap();
        assert!(matches!(
            worker.next_id_at("order", late).await,
            Err(StorageError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_ids_are_distinct() {
        let worker = Arc::new(worker());
        let mut handles = Vec::new();
        for _ in 0..100 {
            let worker = worker.clone();
            handles.push(tokio::spawn(async move { worker.next_id("order").await.unwrap() }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen.len(), 100);
    }
}
