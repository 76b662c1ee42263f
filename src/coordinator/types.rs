// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the cache guard coordinator.

/// Guard lifecycle state.
///
/// Use [`super::CacheGuard::state()`] to check the current state or
/// [`super::CacheGuard::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Connecting to Redis and SQL
    Connecting,
    /// Serving requests
    Ready,
    /// Draining the rebuild pool and order queue
    ShuttingDown,
    /// Background work finished; only direct store access remains
    Stopped,
}

impl std::fmt::Display for GuardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Point-in-time view of background work, for `/ready`-style probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub state: GuardState,
    pub ready: bool,
    /// Rebuild jobs waiting for a worker slot
    pub rebuild_queued: usize,
    pub rebuild_in_flight: usize,
    /// Admitted orders not yet in the durable store
    pub orders_pending: usize,
}
