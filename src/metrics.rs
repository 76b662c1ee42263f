// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for cache-guard.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `cache_guard_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `cache`: key prefix of the cached entity (e.g. `cache:shop:`)
//! - `outcome`: hit, null_hit, miss, stale, ...
//! - `tier`: store, cache, durable

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a cache lookup outcome (hit, null_hit, miss, stale, cold)
pub fn record_cache_lookup(cache: &str, outcome: &str) {
    counter!(
        "cache_guard_cache_lookups_total",
        "cache" => cache.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a loader invocation against the durable store
pub fn record_loader_call(cache: &str) {
    counter!(
        "cache_guard_loader_calls_total",
        "cache" => cache.to_string()
    )
    .increment(1);
}

/// Record a lock attempt (acquired, contended, released, lost)
pub fn record_lock(outcome: &str) {
    counter!(
        "cache_guard_lock_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a finished background rebuild
pub fn record_rebuild(status: &str) {
    counter!(
        "cache_guard_rebuilds_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Set rebuild jobs waiting for a worker slot
pub fn set_rebuild_queue_depth(depth: usize) {
    gauge!("cache_guard_rebuild_queue_depth").set(depth as f64);
}

/// Record a seckill admission outcome
pub fn record_seckill_outcome(outcome: &str) {
    counter!(
        "cache_guard_seckill_attempts_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set orders waiting for the background writer
pub fn set_order_queue_depth(depth: usize) {
    gauge!("cache_guard_order_queue_depth").set(depth as f64);
}

/// Record an issued id
pub fn record_id_issued(tag: &str) {
    counter!(
        "cache_guard_ids_issued_total",
        "tag" => tag.to_string()
    )
    .increment(1);
}

/// Record feed fan-out size
pub fn record_feed_fanout(recipients: usize) {
    histogram!("cache_guard_feed_fanout").record(recipients as f64);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "cache_guard_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an error with category for alerting
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "cache_guard_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Set lifecycle state (for monitoring state machine transitions)
pub fn set_guard_state(state: &str) {
    counter!(
        "cache_guard_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($component:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($component, $op)
    };
}
