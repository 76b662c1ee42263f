// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{CacheClient, CACHE_NULL};
use crate::storage::traits::StorageError;

impl CacheClient {
    /// Cache-aside read with negative caching.
    ///
    /// | cache holds    | result                                   |
    /// |----------------|------------------------------------------|
    /// | value          | deserialized value, loader not called    |
    /// | sentinel       | `None`, loader not called                |
    /// | nothing        | loader result, cached (value or sentinel)|
    ///
    /// A failed or undecodable cache read falls through to the loader; a failed
    /// cache write is logged and the loaded result still returned. Loader
    /// errors propagate. Concurrent misses may each call the loader.
    pub async fn query_with_pass_through<T, I, F, Fut>(
        &self,
        key_prefix: &str,
        id: I,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<T>, StorageError>
    where
        T: Serialize + DeserializeOwned,
        I: Display,
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<Option<T>, StorageError>>,
    {
        let key = format!("{}{}", key_prefix, id);

        match self.kv.get(&key).await {
            Ok(Some(raw)) if raw == CACHE_NULL => {
                crate::metrics::record_cache_lookup(key_prefix, "null_hit");
                return Ok(None);
            }
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    crate::metrics::record_cache_lookup(key_prefix, "hit");
                    return Ok(Some(value));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Undecodable cache entry, reloading");
                    if let Err(e) = self.kv.delete(&key).await {
                        warn!(key = %key, error = %e, "Failed to evict undecodable entry");
                    }
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, falling through to durable store");
                crate::metrics::record_error("cache", "pass_through_get", "unavailable");
            }
        }

        crate::metrics::record_cache_lookup(key_prefix, "miss");
        crate::metrics::record_loader_call(key_prefix);
        let loaded = loader(id).await?;

        let write = match &loaded {
            Some(value) => self.set(&key, value, ttl).await,
            None => {
                debug!(key = %key, ttl = ?self.null_ttl, "Caching absent marker");
                self.kv.set(&key, CACHE_NULL, Some(self.null_ttl)).await
            }
        };
        if let Err(e) = write {
            warn!(key = %key, error = %e, "Cache write after load failed");
        }

        Ok(loaded)
    }
}
