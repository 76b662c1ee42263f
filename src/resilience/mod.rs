// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff and deadlines for calls to the external stores.

pub mod retry;
pub mod timeout;
