// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache key layout.
//!
//! | Prefix            | Type   | Holds                                   |
//! |-------------------|--------|-----------------------------------------|
//! | `cache:shop:`     | string | shop JSON, sentinel, or envelope        |
//! | `lock:`           | string | lock holder token                       |
//! | `incr:`           | string | per-day id sequence                     |
//! | `seckill:stock:`  | string | remaining voucher stock                 |
//! | `seckill:order:`  | string | admission marker per (voucher, user)    |
//! | `feed:`           | zset   | item id → publish time in millis        |
//! | `blog:liked:`     | zset   | user id → like time in millis           |
//! | `sign:`           | bits   | one bit per day of month                |

pub const CACHE_SHOP_KEY: &str = "cache:shop:";
pub const LOCK_PREFIX: &str = "lock:";
pub const ID_PREFIX: &str = "incr:";
pub const SECKILL_STOCK_KEY: &str = "seckill:stock:";
pub const SECKILL_ORDER_KEY: &str = "seckill:order:";
pub const FEED_KEY: &str = "feed:";
pub const BLOG_LIKED_KEY: &str = "blog:liked:";
pub const USER_SIGN_KEY: &str = "sign:";

const CACHE_NAMESPACE: &str = "cache:";

/// Lock name guarding rebuilds of `cache_prefix`: `cache:shop:` → `shop:`.
pub fn rebuild_lock_name(cache_prefix: &str, id: &str) -> String {
    let entity = cache_prefix.strip_prefix(CACHE_NAMESPACE).unwrap_or(cache_prefix);
    format!("{}{}", entity, id)
}

pub fn seckill_stock(voucher_id: i64) -> String {
    format!("{}{}", SECKILL_STOCK_KEY, voucher_id)
}

pub fn seckill_order(voucher_id: i64, user_id: i64) -> String {
    format!("{}{}:{}", SECKILL_ORDER_KEY, voucher_id, user_id)
}

pub fn feed(user_id: i64) -> String {
    format!("{}{}", FEED_KEY, user_id)
}

pub fn blog_liked(blog_id: i64) -> String {
    format!("{}{}", BLOG_LIKED_KEY, blog_id)
}

/// `sign:<user>:<yyyyMM>`
pub fn user_sign(user_id: i64, year_month: &str) -> String {
    format!("{}{}:{}", USER_SIGN_KEY, user_id, year_month)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebuild_lock_name_strips_cache_namespace() {
        assert_eq!(rebuild_lock_name(CACHE_SHOP_KEY, "7"), "shop:7");
        assert_eq!(rebuild_lock_name("hot:", "7"), "hot:7");
    }

    #[test]
    fn test_composite_keys() {
        assert_eq!(seckill_order(3, 9), "seckill:order:3:9");
        assert_eq!(user_sign(9, "202405"), "sign:9:202405");
        assert_eq!(feed(2), "feed:2");
    }
}
