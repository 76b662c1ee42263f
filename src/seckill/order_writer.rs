// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable materialization of admitted orders.
//!
//! Admission already happened in the cache; this side only writes the
//! `(order, stock)` pair that fulfillment reads. The background
//! [`OrderWriter`] drains a bounded queue so a purchase returns as soon as it
//! is admitted. `shutdown` closes the queue and waits for it to empty.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::model::VoucherOrder;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::{DurableStore, StorageError};

/// Take one unit of durable stock and insert the order row, as one write.
///
/// A transient failure may hide a write that committed before its
/// acknowledgement was lost, so every replay first looks the order up and
/// stops if it is already there. `config` bounds those replays.
///
/// Running out of durable stock or colliding with an existing order means
/// the cache and durable store disagree about an admission the cache
/// already granted; both surface as [`StorageError::Invariant`].
pub async fn materialize_order(
    durable: &dyn DurableStore,
    order: &VoucherOrder,
    config: &RetryConfig,
) -> Result<(), StorageError> {
    let replaying = AtomicBool::new(false);
    let replaying = &replaying;
    let created = retry("order_create", config, || async move {
        if replaying.swap(true, Ordering::SeqCst)
            && durable.count_orders(order.user_id, order.voucher_id).await? > 0
        {
            info!(order_id = order.id, "Order already committed by an earlier attempt");
            return Ok(true);
        }
        durable.create_order_with_stock(order).await
    })
    .await;

    match created {
        Ok(true) => {
            debug!(order_id = order.id, user_id = order.user_id, "Order materialized");
            Ok(())
        }
        Ok(false) => {
            error!(
                order_id = order.id,
                voucher_id = order.voucher_id,
                "Durable stock exhausted for a cache-admitted order"
            );
            crate::metrics::record_error("durable", "create_order", "invariant");
            Err(StorageError::Invariant(format!(
                "voucher {} has no durable stock for admitted order {}",
                order.voucher_id, order.id
            )))
        }
        Err(StorageError::Duplicate(what)) => {
            error!(order_id = order.id, %what, "Admitted order collided with an existing one");
            crate::metrics::record_error("durable", "create_order", "invariant");
            Err(StorageError::Invariant(format!("duplicate {}", what)))
        }
        Err(e) => Err(e),
    }
}

pub struct OrderWriter {
    sender: Mutex<Option<mpsc::Sender<VoucherOrder>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl OrderWriter {
    /// Spawn the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(durable: Arc<dyn DurableStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run(durable, rx, pending.clone()));
        Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            pending,
        }
    }

    /// Queue an order; waits for room when the queue is full.
    pub async fn enqueue(&self, order: VoucherOrder) -> Result<(), StorageError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| StorageError::Backend("order writer is shut down".into()))?;

        let depth = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::set_order_queue_depth(depth);
        if let Err(mpsc::error::SendError(order)) = sender.send(order).await {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::Backend(format!("order writer stopped before order {}", order.id)));
        }
        Ok(())
    }

    /// Orders accepted but not yet written.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Close the queue and wait until every accepted order is written or given up on.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Order writer task failed");
            }
            info!("Order writer drained");
        }
    }
}

async fn run(durable: Arc<dyn DurableStore>, mut rx: mpsc::Receiver<VoucherOrder>, pending: Arc<AtomicUsize>) {
    let config = RetryConfig::background();
    while let Some(order) = rx.recv().await {
        if let Err(e) = materialize_order(durable.as_ref(), &order, &config).await {
            error!(
                order_id = order.id,
                user_id = order.user_id,
                voucher_id = order.voucher_id,
                error = %e,
                "Order could not be materialized"
            );
        }
        let depth = pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        crate::metrics::set_order_queue_depth(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Blog, SeckillVoucher, Shop};
    use crate::storage::memory::InMemoryDurableStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum OrderFault {
        /// The write is rejected and nothing lands.
        Reject,
        /// The write lands but the caller sees a timeout.
        LoseAck,
    }

    /// Durable store whose first `faults` order writes misbehave.
    struct FlakyOrderStore {
        inner: InMemoryDurableStore,
        fault: OrderFault,
        faults: AtomicUsize,
    }

    impl FlakyOrderStore {
        async fn new(stock: i32, fault: OrderFault, faults: usize) -> Self {
            let inner = InMemoryDurableStore::new();
            seed_voucher(&inner, stock).await;
            Self {
                inner,
                fault,
                faults: AtomicUsize::new(faults),
            }
        }

        fn take_fault(&self) -> bool {
            self.faults
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl DurableStore for FlakyOrderStore {
        async fn get_shop(&self, id: i64) -> Result<Option<Shop>, StorageError> {
            self.inner.get_shop(id).await
        }
        async fn update_shop(&self, shop: &Shop) -> Result<bool, StorageError> {
            self.inner.update_shop(shop).await
        }
        async fn insert_seckill_voucher(&self, voucher: &SeckillVoucher) -> Result<(), StorageError> {
            self.inner.insert_seckill_voucher(voucher).await
        }
        async fn get_seckill_voucher(&self, voucher_id: i64) -> Result<Option<SeckillVoucher>, StorageError> {
            self.inner.get_seckill_voucher(voucher_id).await
        }
        async fn create_order_with_stock(&self, order: &VoucherOrder) -> Result<bool, StorageError> {
            if !self.take_fault() {
                return self.inner.create_order_with_stock(order).await;
            }
            match self.fault {
                OrderFault::Reject => Err(StorageError::Backend("connection reset".into())),
                OrderFault::LoseAck => {
                    self.inner.create_order_with_stock(order).await?;
                    Err(StorageError::Timeout {
                        op: "create_order".into(),
                        after: Duration::from_millis(5),
                    })
                }
            }
        }
        async fn count_orders(&self, user_id: i64, voucher_id: i64) -> Result<u64, StorageError> {
            self.inner.count_orders(user_id, voucher_id).await
        }
        async fn insert_follow(&self, user_id: i64, follow_user_id: i64) -> Result<(), StorageError> {
            self.inner.insert_follow(user_id, follow_user_id).await
        }
        async fn delete_follow(&self, user_id: i64, follow_user_id: i64) -> Result<bool, StorageError> {
            self.inner.delete_follow(user_id, follow_user_id).await
        }
        async fn is_following(&self, user_id: i64, follow_user_id: i64) -> Result<bool, StorageError> {
            self.inner.is_following(user_id, follow_user_id).await
        }
        async fn follower_ids(&self, author_id: i64) -> Result<Vec<i64>, StorageError> {
            self.inner.follower_ids(author_id).await
        }
        async fn followee_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
            self.inner.followee_ids(user_id).await
        }
        async fn insert_blog(&self, blog: &Blog) -> Result<i64, StorageError> {
            self.inner.insert_blog(blog).await
        }
        async fn get_blog(&self, id: i64) -> Result<Option<Blog>, StorageError> {
            self.inner.get_blog(id).await
        }
        async fn adjust_blog_likes(&self, id: i64, delta: i64) -> Result<bool, StorageError> {
            self.inner.adjust_blog_likes(id, delta).await
        }
    }

    async fn seed_voucher(durable: &InMemoryDurableStore, stock: i32) {
        let now = Utc::now();
        durable
            .insert_seckill_voucher(&SeckillVoucher {
                voucher_id: 1,
                stock,
                begin_time: now - ChronoDuration::hours(1),
                end_time: now + ChronoDuration::hours(1),
            })
            .await
            .unwrap();
    }

    async fn store_with_voucher(stock: i32) -> Arc<InMemoryDurableStore> {
        let durable = Arc::new(InMemoryDurableStore::new());
        seed_voucher(&durable, stock).await;
        durable
    }

    fn order(id: i64, user_id: i64) -> VoucherOrder {
        VoucherOrder {
            id,
            user_id,
            voucher_id: 1,
            create_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_materialize_decrements_and_inserts() {
        let durable = store_with_voucher(2).await;
        materialize_order(durable.as_ref(), &order(10, 7), &RetryConfig::once()).await.unwrap();
        assert_eq!(durable.stock_of(1), Some(1));
        assert_eq!(durable.order_count(), 1);
    }

    #[tokio::test]
    async fn test_materialize_without_durable_stock_is_invariant() {
        let durable = store_with_voucher(0).await;
        let result = materialize_order(durable.as_ref(), &order(10, 7), &RetryConfig::once()).await;
        assert!(matches!(result, Err(StorageError::Invariant(_))));
        assert_eq!(durable.order_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_order_write_leaves_stock_untouched() {
        let durable = FlakyOrderStore::new(5, OrderFault::Reject, usize::MAX).await;
        let result = materialize_order(&durable, &order(10, 7), &RetryConfig::test()).await;

        assert!(matches!(result, Err(StorageError::Backend(_))));
        assert_eq!(durable.inner.order_count(), 0);
        assert_eq!(durable.inner.stock_of(1), Some(5));
    }

    #[tokio::test]
    async fn test_rejected_write_is_replayed() {
        let durable = FlakyOrderStore::new(5, OrderFault::Reject, 1).await;
        materialize_order(&durable, &order(10, 7), &RetryConfig::test()).await.unwrap();

        assert_eq!(durable.inner.order_count(), 1);
        assert_eq!(durable.inner.stock_of(1), Some(4));
    }

    #[tokio::test]
    async fn test_lost_acknowledgement_takes_one_unit() {
        let durable = FlakyOrderStore::new(5, OrderFault::LoseAck, 1).await;
        materialize_order(&durable, &order(10, 7), &RetryConfig::test()).await.unwrap();

        assert_eq!(durable.inner.order_count(), 1);
        assert_eq!(durable.inner.stock_of(1), Some(4));
    }

    #[tokio::test]
    async fn test_duplicate_order_is_invariant_and_keeps_stock() {
        let durable = store_with_voucher(3).await;
        materialize_order(durable.as_ref(), &order(10, 7), &RetryConfig::once()).await.unwrap();
        let result = materialize_order(durable.as_ref(), &order(11, 7), &RetryConfig::once()).await;

        assert!(matches!(result, Err(StorageError::Invariant(_))));
        assert_eq!(durable.order_count(), 1);
        assert_eq!(durable.stock_of(1), Some(2));
    }

    #[tokio::test]
    async fn test_writer_drains_on_shutdown() {
        let durable = store_with_voucher(5).await;
        let writer = OrderWriter::spawn(durable.clone(), 2);
        for user in 1..=5 {
            writer.enqueue(order(100 + user, user)).await.unwrap();
        }
        writer.shutdown().await;

        assert_eq!(durable.order_count(), 5);
        assert_eq!(durable.stock_of(1), Some(0));
        assert_eq!(writer.pending(), 0);
        assert!(writer.enqueue(order(200, 9)).await.is_err());
    }
}
