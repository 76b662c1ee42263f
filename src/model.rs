// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Records owned by the durable store.
//!
//! These are plain serde structs: the cache layers store them as JSON, the SQL
//! backend maps them column by column. Timestamps are UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A shop as served by the cache loaders.
///
/// # Example
///
/// ```
/// use cache_guard::Shop;
///
/// let shop = Shop::new(1, "Tea House");
/// assert_eq!(shop.id, 1);
/// assert_eq!(shop.score, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub type_id: i64,
    #[serde(default)]
    pub address: String,
    /// Average spend per customer, in the smallest currency unit
    #[serde(default)]
    pub avg_price: i64,
    #[serde(default)]
    pub sold: i64,
    /// Rating x10 (e.g. 47 = 4.7 stars)
    #[serde(default)]
    pub score: i32,
    #[serde(default)]
    pub open_hours: String,
}

impl Shop {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            type_id: 0,
            address: String::new(),
            avg_price: 0,
            sold: 0,
            score: 0,
            open_hours: String::new(),
        }
    }
}

/// Flash-sale voucher with its durable stock counter and activity window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeckillVoucher {
    pub voucher_id: i64,
    pub stock: i32,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SeckillVoucher {
    /// Whether `now` falls inside `[begin_time, end_time]`.
    #[must_use]
    pub fn window_contains(&self, now: DateTime<Utc>) -> bool {
        now >= self.begin_time && now <= self.end_time
    }
}

/// At most one per `(user_id, voucher_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherOrder {
    pub id: i64,
    pub user_id: i64,
    pub voucher_id: i64,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blog {
    /// Assigned by the durable store on insert; zero before that.
    #[serde(default)]
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub shop_id: i64,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub liked: i64,
    pub create_time: DateTime<Utc>,
}

impl Blog {
    pub fn draft(user_id: i64, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            user_id,
            shop_id: 0,
            title: title.into(),
            content: content.into(),
            liked: 0,
            create_time: Utc::now(),
        }
    }
}
