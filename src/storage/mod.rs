// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! - [`traits`]: the [`KvStore`](traits::KvStore) and
//!   [`DurableStore`](traits::DurableStore) contracts
//! - [`memory`]: in-process implementations of both (tests, single-node use)
//! - [`redis`]: Redis-backed [`KvStore`](traits::KvStore)
//! - [`sql`]: MySQL/SQLite-backed [`DurableStore`](traits::DurableStore)

pub mod traits;
pub mod memory;
pub mod redis;
pub mod sql;
