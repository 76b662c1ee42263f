// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shop lookups wired onto both cache loaders.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::cache::CacheClient;
use crate::keys::CACHE_SHOP_KEY;
use crate::model::Shop;
use crate::storage::traits::{DurableStore, KvStore, StorageError};

pub struct ShopService {
    cache: Arc<CacheClient>,
    kv: Arc<dyn KvStore>,
    durable: Arc<dyn DurableStore>,
    cache_ttl: Duration,
    logical_expire: Duration,
}

impl ShopService {
    pub fn new(
        cache: Arc<CacheClient>,
        kv: Arc<dyn KvStore>,
        durable: Arc<dyn DurableStore>,
        cache_ttl: Duration,
        logical_expire: Duration,
    ) -> Self {
        Self {
            cache,
            kv,
            durable,
            cache_ttl,
            logical_expire,
        }
    }

    /// Cache-aside read; missing shops are negatively cached.
    #[instrument(skip(self))]
    pub async fn query_by_id(&self, id: i64) -> Result<Option<Shop>, StorageError> {
        let durable = self.durable.clone();
        self.cache
            .query_with_pass_through(CACHE_SHOP_KEY, id, self.cache_ttl, move |id| async move {
                durable.get_shop(id).await
            })
            .await
    }

    /// Stale-while-revalidate read for shops pre-loaded with [`warm`](Self::warm).
    #[instrument(skip(self))]
    pub async fn query_hot(&self, id: i64) -> Result<Option<Shop>, StorageError> {
        let durable = self.durable.clone();
        self.cache
            .query_with_logical_expire(CACHE_SHOP_KEY, id, self.logical_expire, move |id| async move {
                durable.get_shop(id).await
            })
            .await
    }

    /// Write a hot-key envelope for `id` expiring after `expire`.
    /// Returns false when the shop does not exist.
    pub async fn warm(&self, id: i64, expire: Duration) -> Result<bool, StorageError> {
        let durable = self.durable.clone();
        self.cache
            .warm(CACHE_SHOP_KEY, id, expire, move |id| async move { durable.get_shop(id).await })
            .await
    }

    /// Update the durable row, then invalidate the cached copy.
    ///
    /// Returns `Ok(false)` for a non-positive id or an unknown shop.
    pub async fn update(&self, shop: &Shop) -> Result<bool, StorageError> {
        if shop.id <= 0 {
            return Ok(false);
        }
        if !self.durable.update_shop(shop).await? {
            return Ok(false);
        }
        let key = format!("{}{}", CACHE_SHOP_KEY, shop.id);
        self.kv.delete(&key).await?;
        debug!(shop_id = shop.id, "Shop updated, cache invalidated");
        Ok(true)
    }
}
