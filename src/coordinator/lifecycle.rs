// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Guard lifecycle: connect at startup, drain at shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use crate::config::CacheGuardConfig;
use crate::storage::redis::RedisKvStore;
use crate::storage::sql::SqlStore;
use crate::storage::traits::StorageError;

use super::{CacheGuard, GuardState};

impl CacheGuard {
    /// Connect to the configured Redis and SQL backends and assemble the guard.
    ///
    /// Startup flow:
    /// 1. Validate config
    /// 2. Connect to SQL (ground truth), creating tables if missing
    /// 3. Connect to Redis (cache store), loading the atomic scripts
    /// 4. Spawn the rebuild pool and order writer → Ready
    ///
    /// Both URLs are required: every service depends on both stores.
    #[tracing::instrument(skip(config), fields(has_redis, has_sql))]
    pub async fn start(config: CacheGuardConfig) -> Result<Self, StorageError> {
        let startup_start = std::time::Instant::now();
        let (state, state_rx) = watch::channel(GuardState::Connecting);
        crate::metrics::set_guard_state("Connecting");
        info!("Starting cache guard...");

        config.validate()?;

        let sql_url = config
            .sql_url
            .clone()
            .ok_or_else(|| StorageError::Backend("sql_url is required".into()))?;
        let redis_url = config
            .redis_url
            .clone()
            .ok_or_else(|| StorageError::Backend("redis_url is required".into()))?;

        info!(url = %sql_url, "Connecting to SQL (ground truth)...");
        let durable = SqlStore::new(&sql_url, config.op_timeout()).await.map_err(|e| {
            tracing::Span::current().record("has_sql", false);
            error!(error = %e, "Failed to connect to SQL");
            crate::metrics::record_error("durable", "connect", "unavailable");
            e
        })?;
        tracing::Span::current().record("has_sql", true);
        crate::metrics::record_latency("lifecycle", "sql_connect", startup_start.elapsed());

        info!(url = %redis_url, prefix = ?config.redis_prefix, "Connecting to Redis (cache store)...");
        let kv = RedisKvStore::with_prefix(&redis_url, config.redis_prefix.as_deref(), config.op_timeout())
            .await
            .map_err(|e| {
                tracing::Span::current().record("has_redis", false);
                error!(error = %e, "Failed to connect to Redis");
                crate::metrics::record_error("cache", "connect", "unavailable");
                e
            })?;
        tracing::Span::current().record("has_redis", true);

        let guard = Self::assemble(Arc::new(kv), Arc::new(durable), config, state, state_rx)?;
        crate::metrics::record_latency("lifecycle", "startup", startup_start.elapsed());
        Ok(guard)
    }

    /// Stop background work: pending rebuilds finish and release their
    /// locks, queued orders reach the durable store.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = std::time::Instant::now();
        let _ = self.state.send(GuardState::ShuttingDown);
        crate::metrics::set_guard_state("ShuttingDown");
        info!(
            rebuilds = self.pool.queued() + self.pool.in_flight(),
            orders = self.seckill.pending_orders(),
            "Initiating cache guard shutdown..."
        );

        self.pool.shutdown().await;
        self.seckill.shutdown().await;

        let _ = self.state.send(GuardState::Stopped);
        crate::metrics::set_guard_state("Stopped");
        crate::metrics::record_latency("lifecycle", "shutdown", shutdown_start.elapsed());
        info!("Cache guard shutdown complete");
    }
}
