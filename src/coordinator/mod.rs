// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache guard coordinator.
//!
//! [`CacheGuard`] owns the process-wide pieces and hands out the services
//! built on them:
//! - one cache store and one durable store, shared by every service
//! - the [`RebuildPool`], built once here and drained on shutdown
//! - the seckill order writer (async materialization mode)
//!
//! # Lifecycle
//!
//! ```text
//! Connecting → Ready → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cache_guard::{CacheGuard, CacheGuardConfig, GuardState};
//! use cache_guard::storage::memory::{InMemoryDurableStore, InMemoryKvStore};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let guard = CacheGuard::from_parts(
//!     Arc::new(InMemoryKvStore::new()),
//!     Arc::new(InMemoryDurableStore::new()),
//!     CacheGuardConfig::default(),
//! )
//! .expect("valid config");
//! assert_eq!(guard.state(), GuardState::Ready);
//! guard.shutdown().await;
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{GuardState, HealthCheck};

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::cache::{CacheClient, RebuildPool};
use crate::config::CacheGuardConfig;
use crate::feed::{FeedService, FollowService};
use crate::id_worker::IdWorker;
use crate::likes::LikeService;
use crate::lock::SimpleLock;
use crate::seckill::SeckillService;
use crate::shop::ShopService;
use crate::sign::SignService;
use crate::storage::traits::{DurableStore, KvStore, StorageError};

pub struct CacheGuard {
    config: CacheGuardConfig,
    state: watch::Sender<GuardState>,
    state_rx: watch::Receiver<GuardState>,
    kv: Arc<dyn KvStore>,
    durable: Arc<dyn DurableStore>,
    pool: Arc<RebuildPool>,
    cache: Arc<CacheClient>,
    ids: Arc<IdWorker>,
    shops: ShopService,
    seckill: SeckillService,
    feed: FeedService,
    follows: FollowService,
    likes: LikeService,
    signs: SignService,
}

impl CacheGuard {
    /// Assemble a guard over already-connected stores. Spawns the rebuild
    /// dispatcher (and order writer), so it must run inside a Tokio runtime.
    pub fn from_parts(
        kv: Arc<dyn KvStore>,
        durable: Arc<dyn DurableStore>,
        config: CacheGuardConfig,
    ) -> Result<Self, StorageError> {
        let (state, state_rx) = watch::channel(GuardState::Connecting);
        Self::assemble(kv, durable, config, state, state_rx)
    }

    fn assemble(
        kv: Arc<dyn KvStore>,
        durable: Arc<dyn DurableStore>,
        config: CacheGuardConfig,
        state: watch::Sender<GuardState>,
        state_rx: watch::Receiver<GuardState>,
    ) -> Result<Self, StorageError> {
        config.validate()?;

        let pool = Arc::new(RebuildPool::new(config.rebuild_concurrency));
        let cache = Arc::new(CacheClient::new(
            kv.clone(),
            pool.clone(),
            config.cache_null_ttl(),
            config.lock_ttl(),
        ));
        let ids = Arc::new(IdWorker::new(kv.clone(), config.id_epoch_secs, config.id_sequence_bits));

        let shops = ShopService::new(
            cache.clone(),
            kv.clone(),
            durable.clone(),
            config.cache_ttl(),
            config.logical_expire(),
        );
        let seckill = SeckillService::new(
            kv.clone(),
            durable.clone(),
            ids.clone(),
            config.order_materialization,
            config.order_queue_capacity,
        );
        let feed = FeedService::new(kv.clone(), durable.clone()).with_page_size(config.feed_page_size);
        let follows = FollowService::new(durable.clone());
        let likes = LikeService::new(kv.clone(), durable.clone());
        let signs = SignService::new(kv.clone());

        let _ = state.send(GuardState::Ready);
        crate::metrics::set_guard_state("Ready");
        info!(
            rebuild_concurrency = config.rebuild_concurrency,
            orders = ?config.order_materialization,
            "Cache guard ready"
        );

        Ok(Self {
            config,
            state,
            state_rx,
            kv,
            durable,
            pool,
            cache,
            ids,
            shops,
            seckill,
            feed,
            follows,
            likes,
            signs,
        })
    }

    #[must_use]
    pub fn state(&self) -> GuardState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<GuardState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == GuardState::Ready
    }

    pub fn config(&self) -> &CacheGuardConfig {
        &self.config
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub fn cache(&self) -> &Arc<CacheClient> {
        &self.cache
    }

    pub fn rebuild_pool(&self) -> &Arc<RebuildPool> {
        &self.pool
    }

    pub fn ids(&self) -> &Arc<IdWorker> {
        &self.ids
    }

    pub fn shops(&self) -> &ShopService {
        &self.shops
    }

    pub fn seckill(&self) -> &SeckillService {
        &self.seckill
    }

    pub fn feed(&self) -> &FeedService {
        &self.feed
    }

    pub fn follows(&self) -> &FollowService {
        &self.follows
    }

    pub fn likes(&self) -> &LikeService {
        &self.likes
    }

    pub fn signs(&self) -> &SignService {
        &self.signs
    }

    /// A fresh lock handle on `lock:<name>` over the shared cache store.
    pub fn lock(&self, name: &str) -> SimpleLock {
        SimpleLock::new(self.kv.clone(), name)
    }

    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        HealthCheck {
            state,
            ready: state == GuardState::Ready,
            rebuild_queued: self.pool.queued(),
            rebuild_in_flight: self.pool.in_flight(),
            orders_pending: self.seckill.pending_orders(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrderMaterialization;
    use crate::context::UserIdentity;
    use crate::model::{SeckillVoucher, Shop};
    use crate::seckill::PurchaseOutcome;
    use crate::storage::memory::{InMemoryDurableStore, InMemoryKvStore};
    use chrono::{Duration as ChronoDuration, Utc};

    fn guard(config: CacheGuardConfig) -> (CacheGuard, Arc<InMemoryDurableStore>) {
        let durable = Arc::new(InMemoryDurableStore::new());
        let guard = CacheGuard::from_parts(Arc::new(InMemoryKvStore::new()), durable.clone(), config).unwrap();
        (guard, durable)
    }

    #[tokio::test]
    async fn test_from_parts_is_ready_and_shuts_down() {
        let (guard, _) = guard(CacheGuardConfig::default());
        assert!(guard.is_ready());
        let health = guard.health_check();
        assert_eq!(health.rebuild_queued, 0);
        assert_eq!(health.orders_pending, 0);

        guard.shutdown().await;
        assert_eq!(guard.state(), GuardState::Stopped);
        assert!(!guard.health_check().ready);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = CacheGuardConfig {
            rebuild_concurrency: 0,
            ..Default::default()
        };
        let result = CacheGuard::from_parts(
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryDurableStore::new()),
            config,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_services_share_stores() {
        let (guard, durable) = guard(CacheGuardConfig {
            order_materialization: OrderMaterialization::Sync,
            ..Default::default()
        });
        durable.insert_shop(Shop::new(1, "Shared"));
        assert_eq!(guard.shops().query_by_id(1).await.unwrap().unwrap().name, "Shared");
        assert!(guard.kv().get("cache:shop:1").await.unwrap().is_some());

        let now = Utc::now();
        guard
            .seckill()
            .publish_voucher(&SeckillVoucher {
                voucher_id: 9,
                stock: 1,
                begin_time: now - ChronoDuration::minutes(1),
                end_time: now + ChronoDuration::minutes(1),
            })
            .await
            .unwrap();
        let outcome = guard.seckill().attempt_purchase(9, &UserIdentity::new(4)).await.unwrap();
        assert!(matches!(outcome, PurchaseOutcome::Admitted { .. }));
        assert_eq!(durable.order_count(), 1);

        let lock = guard.lock("demo");
        assert!(lock.try_lock(std::time::Duration::from_secs(1)).await.unwrap());
        assert!(!guard.lock("demo").try_lock(std::time::Duration::from_secs(1)).await.unwrap());
    }
}
