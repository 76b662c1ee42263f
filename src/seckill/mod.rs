// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flash-sale admission.
//!
//! ```text
//! attempt_purchase(voucher, user)
//!   │ durable lookup ── missing ─────────────────────▶ NotFound
//!   │ activity window ── before/after ───────────────▶ NotStarted / Ended
//!   ▼
//! SeckillAdmit script on seckill:stock:<v>, seckill:order:<v>:<u>
//!   ├─ 1 ────────────────────────────────────────────▶ NoStock
//!   ├─ 2 ────────────────────────────────────────────▶ Duplicate
//!   └─ 0 ── next_id("order") ── materialize ─────────▶ Admitted { order_id }
//!                                (inline or queued)
//! ```
//!
//! The script is the only place stock and admission markers change, so the
//! check and the decrement are one linearizable step per voucher across any
//! number of processes. The durable `(user, voucher)` unique key stays
//! underneath as a second guard.

pub mod order_writer;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use crate::config::OrderMaterialization;
use crate::context::UserIdentity;
use crate::id_worker::IdWorker;
use crate::keys;
use crate::model::{SeckillVoucher, VoucherOrder};
use crate::resilience::retry::RetryConfig;
use crate::storage::traits::{AtomicScript, DurableStore, KvStore, StorageError};

pub use order_writer::{materialize_order, OrderWriter};

/// Terminal state of one purchase attempt. Rejections are ordinary outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseOutcome {
    Admitted { order_id: i64 },
    NoStock,
    Duplicate,
    NotStarted,
    Ended,
    NotFound,
}

impl PurchaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted { .. } => "admitted",
            Self::NoStock => "no_stock",
            Self::Duplicate => "duplicate",
            Self::NotStarted => "not_started",
            Self::Ended => "ended",
            Self::NotFound => "not_found",
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

pub struct SeckillService {
    kv: Arc<dyn KvStore>,
    durable: Arc<dyn DurableStore>,
    ids: Arc<IdWorker>,
    writer: Option<OrderWriter>,
}

impl SeckillService {
    /// In [`OrderMaterialization::Async`] mode this spawns the order writer.
    pub fn new(
        kv: Arc<dyn KvStore>,
        durable: Arc<dyn DurableStore>,
        ids: Arc<IdWorker>,
        mode: OrderMaterialization,
        queue_capacity: usize,
    ) -> Self {
        let writer = match mode {
            OrderMaterialization::Async => Some(OrderWriter::spawn(durable.clone(), queue_capacity)),
            OrderMaterialization::Sync => None,
        };
        Self {
            kv,
            durable,
            ids,
            writer,
        }
    }

    pub fn mode(&self) -> OrderMaterialization {
        if self.writer.is_some() {
            OrderMaterialization::Async
        } else {
            OrderMaterialization::Sync
        }
    }

    /// Persist the voucher and seed its cache stock counter.
    pub async fn publish_voucher(&self, voucher: &SeckillVoucher) -> Result<(), StorageError> {
        if voucher.stock < 0 || voucher.end_time < voucher.begin_time {
            return Err(StorageError::Invariant(format!(
                "voucher {} has negative stock or an inverted window",
                voucher.voucher_id
            )));
        }
        self.durable.insert_seckill_voucher(voucher).await?;
        self.kv
            .set(&keys::seckill_stock(voucher.voucher_id), &voucher.stock.to_string(), None)
            .await?;
        info!(voucher_id = voucher.voucher_id, stock = voucher.stock, "Seckill voucher published");
        Ok(())
    }

    #[instrument(skip(self, user), fields(user_id = user.id))]
    pub async fn attempt_purchase(&self, voucher_id: i64, user: &UserIdentity) -> Result<PurchaseOutcome, StorageError> {
        self.attempt_purchase_at(voucher_id, user, Utc::now()).await
    }

    /// [`attempt_purchase`](Self::attempt_purchase) against an explicit clock reading.
    pub async fn attempt_purchase_at(
        &self,
        voucher_id: i64,
        user: &UserIdentity,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOutcome, StorageError> {
        let _timer = crate::time_operation!("seckill", "attempt_purchase");

        let outcome = match self.durable.get_seckill_voucher(voucher_id).await? {
            None => PurchaseOutcome::NotFound,
            Some(voucher) if voucher.window_contains(now) => self.admit(voucher_id, user.id, now).await?,
            Some(voucher) if now < voucher.begin_time => PurchaseOutcome::NotStarted,
            Some(_) => PurchaseOutcome::Ended,
        };

        crate::metrics::record_seckill_outcome(outcome.as_str());
        Ok(outcome)
    }

    async fn admit(&self, voucher_id: i64, user_id: i64, now: DateTime<Utc>) -> Result<PurchaseOutcome, StorageError> {
        let code = self
            .kv
            .execute_atomic(
                AtomicScript::SeckillAdmit,
                &[keys::seckill_stock(voucher_id), keys::seckill_order(voucher_id, user_id)],
                &[user_id.to_string()],
            )
            .await?;

        match code {
            0 => {}
            1 => return Ok(PurchaseOutcome::NoStock),
            2 => return Ok(PurchaseOutcome::Duplicate),
            other => {
                error!(voucher_id, user_id, code = other, "Admission script returned an unknown code");
                return Err(StorageError::Invariant(format!("admission script returned {}", other)));
            }
        }

        let order_id = self.ids.next_id("order").await.map_err(|e| {
            // The marker and the decremented stock stay; the user will read as a duplicate.
            error!(voucher_id, user_id, error = %e, "Admitted but no order id could be issued");
            e
        })?;

        let order = VoucherOrder {
            id: order_id,
            user_id,
            voucher_id,
            create_time: now,
        };

        match &self.writer {
            Some(writer) => writer.enqueue(order).await?,
            None => materialize_order(self.durable.as_ref(), &order, &RetryConfig::query()).await?,
        }

        Ok(PurchaseOutcome::Admitted { order_id })
    }

    /// Remaining stock as seen by the admission script.
    pub async fn cached_stock(&self, voucher_id: i64) -> Result<Option<i64>, StorageError> {
        match self.kv.get(&keys::seckill_stock(voucher_id)).await? {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|e| StorageError::Serialization(format!("stock counter {}: {}", raw, e))),
        }
    }

    /// Admitted orders not yet written (always 0 in sync mode).
    pub fn pending_orders(&self) -> usize {
        self.writer.as_ref().map_or(0, OrderWriter::pending)
    }

    /// Wait for queued orders to reach the durable store.
    pub async fn shutdown(&self) {
        if let Some(writer) = &self.writer {
            if writer.pending() > 0 {
                warn!(pending = writer.pending(), "Draining queued orders");
            }
            writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{InMemoryDurableStore, InMemoryKvStore};
    use chrono::Duration as ChronoDuration;

    fn voucher(id: i64, stock: i32) -> SeckillVoucher {
        let now = Utc::now();
        SeckillVoucher {
            voucher_id: id,
            stock,
            begin_time: now - ChronoDuration::hours(1),
            end_time: now + ChronoDuration::hours(1),
        }
    }

    fn service(mode: OrderMaterialization) -> (SeckillService, Arc<InMemoryKvStore>, Arc<InMemoryDurableStore>) {
        let kv = Arc::new(InMemoryKvStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        let ids = Arc::new(IdWorker::new(kv.clone(), 1_640_995_200, 32));
        let service = SeckillService::new(kv.clone(), durable.clone(), ids, mode, 64);
        (service, kv, durable)
    }

    #[tokio::test]
    async fn test_sync_purchase_materializes_inline() {
        let (service, _, durable) = service(OrderMaterialization::Sync);
        service.publish_voucher(&voucher(1, 2)).await.unwrap();

        let outcome = service.attempt_purchase(1, &UserIdentity::new(7)).await.unwrap();
        let PurchaseOutcome::Admitted { order_id } = outcome else {
            panic!("expected admission, got {:?}", outcome);
        };
        assert_eq!(durable.orders()[0].id, order_id);
        assert_eq!(durable.stock_of(1), Some(1));
        assert_eq!(service.cached_stock(1).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_second_attempt_by_same_user_is_duplicate() {
        let (service, _, durable) = service(OrderMaterialization::Sync);
        service.publish_voucher(&voucher(1, 5)).await.unwrap();
        let user = UserIdentity::new(3);

        assert!(service.attempt_purchase(1, &user).await.unwrap().is_admitted());
        assert_eq!(service.attempt_purchase(1, &user).await.unwrap(), PurchaseOutcome::Duplicate);
        assert_eq!(durable.order_count(), 1);
        assert_eq!(service.cached_stock(1).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_window_and_missing_voucher() {
        let (service, _, _) = service(OrderMaterialization::Sync);
        let v = voucher(2, 1);
        service.publish_voucher(&v).await.unwrap();
        let user = UserIdentity::new(1);

        let early = v.begin_time - ChronoDuration::seconds(1);
        let late = v.end_time + ChronoDuration::seconds(1);
        assert_eq!(service.attempt_purchase_at(2, &user, early).await.unwrap(), PurchaseOutcome::NotStarted);
        assert_eq!(service.attempt_purchase_at(2, &user, late).await.unwrap(), PurchaseOutcome::Ended);
        assert_eq!(service.attempt_purchase(99, &user).await.unwrap(), PurchaseOutcome::NotFound);
        assert_eq!(service.cached_stock(2).await.unwrap(), Some(1));

        // Both window bounds are inclusive.
        assert!(service.attempt_purchase_at(2, &user, v.end_time).await.unwrap().is_admitted());
        assert_eq!(service.cached_stock(2).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_exhausted_stock_has_no_side_effects() {
        let (service, kv, _) = service(OrderMaterialization::Sync);
        service.publish_voucher(&voucher(3, 1)).await.unwrap();

        assert!(service.attempt_purchase(3, &UserIdentity::new(1)).await.unwrap().is_admitted());
        assert_eq!(
            service.attempt_purchase(3, &UserIdentity::new(2)).await.unwrap(),
            PurchaseOutcome::NoStock
        );
        assert!(kv.get("seckill:order:3:2").await.unwrap().is_none());
        assert_eq!(service.cached_stock(3).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_async_mode_writes_after_shutdown() {
        let (service, _, durable) = service(OrderMaterialization::Async);
        assert_eq!(service.mode(), OrderMaterialization::Async);
        service.publish_voucher(&voucher(4, 3)).await.unwrap();
        for user in 1..=3 {
            assert!(service.attempt_purchase(4, &UserIdentity::new(user)).await.unwrap().is_admitted());
        }
        service.shutdown().await;
        assert_eq!(durable.order_count(), 3);
        assert_eq!(durable.stock_of(4), Some(0));
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_voucher() {
        let (service, _, _) = service(OrderMaterialization::Sync);
        assert!(service.publish_voucher(&voucher(5, -1)).await.is_err());
    }
}
