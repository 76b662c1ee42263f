// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for [`DurableStore`] (MySQL or SQLite via the sqlx `Any` driver).
//!
//! Schema (MySQL flavor):
//! ```sql
//! CREATE TABLE tb_shop (id BIGINT PRIMARY KEY, name VARCHAR(128), type_id BIGINT, ...);
//! CREATE TABLE tb_seckill_voucher (voucher_id BIGINT PRIMARY KEY, stock INT,
//!                                  begin_time BIGINT, end_time BIGINT);
//! CREATE TABLE tb_voucher_order (id BIGINT PRIMARY KEY, user_id BIGINT, voucher_id BIGINT,
//!                                create_time BIGINT, UNIQUE (user_id, voucher_id));
//! CREATE TABLE tb_follow (user_id BIGINT, follow_user_id BIGINT, create_time BIGINT,
//!                         PRIMARY KEY (user_id, follow_user_id));
//! CREATE TABLE tb_blog (id BIGINT AUTO_INCREMENT PRIMARY KEY, user_id BIGINT, ...);
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! - Timestamps are stored as epoch millis (`BIGINT`): `Any` has no portable
//!   date-time mapping.
//! - MySQL `TEXT` columns come back as bytes, so text is read as `String` first
//!   and falls back to `Vec<u8>`.
//!
//! The `(user_id, voucher_id)` unique key is the last line of defense beneath
//! the cache admission marker; a hit surfaces as [`StorageError::Duplicate`].

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::warn;

use super::traits::{DurableStore, StorageError};
use crate::model::{Blog, SeckillVoucher, Shop, VoucherOrder};
use crate::resilience::retry::{retry, RetryConfig};
use crate::resilience::timeout::deadline;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn map_sql_error(what: &str, err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(ref db) = err {
        if db.is_unique_violation() {
            return StorageError::Duplicate(what.to_string());
        }
    }
    StorageError::Backend(format!("{}: {}", what, err))
}

fn text_column(row: &AnyRow, column: &str) -> String {
    row.try_get::<String, _>(column)
        .ok()
        .or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
        .unwrap_or_default()
}

fn millis_to_time(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

const SQLITE_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS tb_shop (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        type_id INTEGER NOT NULL DEFAULT 0,
        address TEXT NOT NULL DEFAULT '',
        avg_price INTEGER NOT NULL DEFAULT 0,
        sold INTEGER NOT NULL DEFAULT 0,
        score INTEGER NOT NULL DEFAULT 0,
        open_hours TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tb_seckill_voucher (
        voucher_id INTEGER PRIMARY KEY,
        stock INTEGER NOT NULL,
        begin_time INTEGER NOT NULL,
        end_time INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tb_voucher_order (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        voucher_id INTEGER NOT NULL,
        create_time INTEGER NOT NULL,
        UNIQUE (user_id, voucher_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tb_follow (
        user_id INTEGER NOT NULL,
        follow_user_id INTEGER NOT NULL,
        create_time INTEGER NOT NULL,
        PRIMARY KEY (user_id, follow_user_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tb_blog (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        shop_id INTEGER NOT NULL DEFAULT 0,
        title TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        liked INTEGER NOT NULL DEFAULT 0,
        create_time INTEGER NOT NULL
    )"#,
];

const MYSQL_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS tb_shop (
        id BIGINT PRIMARY KEY,
        name VARCHAR(128) NOT NULL,
        type_id BIGINT NOT NULL DEFAULT 0,
        address VARCHAR(255) NOT NULL DEFAULT '',
        avg_price BIGINT NOT NULL DEFAULT 0,
        sold BIGINT NOT NULL DEFAULT 0,
        score INT NOT NULL DEFAULT 0,
        open_hours VARCHAR(64) NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tb_seckill_voucher (
        voucher_id BIGINT PRIMARY KEY,
        stock INT NOT NULL,
        begin_time BIGINT NOT NULL,
        end_time BIGINT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tb_voucher_order (
        id BIGINT PRIMARY KEY,
        user_id BIGINT NOT NULL,
        voucher_id BIGINT NOT NULL,
        create_time BIGINT NOT NULL,
        UNIQUE KEY uk_user_voucher (user_id, voucher_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tb_follow (
        user_id BIGINT NOT NULL,
        follow_user_id BIGINT NOT NULL,
        create_time BIGINT NOT NULL,
        PRIMARY KEY (user_id, follow_user_id),
        INDEX idx_follow_user (follow_user_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tb_blog (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        user_id BIGINT NOT NULL,
        shop_id BIGINT NOT NULL DEFAULT 0,
        title VARCHAR(255) NOT NULL,
        content LONGTEXT NOT NULL,
        liked BIGINT NOT NULL DEFAULT 0,
        create_time BIGINT NOT NULL
    )"#,
];

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
    op_timeout: Duration,
}

impl SqlStore {
    /// Connect with startup-mode retry and create the schema if missing.
    pub async fn new(connection_string: &str, op_timeout: Duration) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self {
            pool,
            is_sqlite,
            op_timeout,
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = if self.is_sqlite { SQLITE_SCHEMA } else { MYSQL_SCHEMA };
        for statement in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .map(|_| ())
                    .map_err(|e| map_sql_error("init_schema", e))
            })
            .await?;
        }
        Ok(())
    }

    fn shop_from_row(row: &AnyRow) -> Result<Shop, StorageError> {
        Ok(Shop {
            id: row.try_get("id").map_err(|e| map_sql_error("shop.id", e))?,
            name: text_column(row, "name"),
            type_id: row.try_get("type_id").unwrap_or(0),
            address: text_column(row, "address"),
            avg_price: row.try_get("avg_price").unwrap_or(0),
            sold: row.try_get("sold").unwrap_or(0),
            score: row.try_get("score").unwrap_or(0),
            open_hours: text_column(row, "open_hours"),
        })
    }

    fn blog_from_row(row: &AnyRow) -> Result<Blog, StorageError> {
        Ok(Blog {
            id: row.try_get("id").map_err(|e| map_sql_error("blog.id", e))?,
            user_id: row.try_get("user_id").unwrap_or(0),
            shop_id: row.try_get("shop_id").unwrap_or(0),
            title: text_column(row, "title"),
            content: text_column(row, "content"),
            liked: row.try_get("liked").unwrap_or(0),
            create_time: millis_to_time(row.try_get("create_time").unwrap_or(0)),
        })
    }

    async fn id_column(&self, op: &'static str, sql: &'static str, bind: i64) -> Result<Vec<i64>, StorageError> {
        retry(op, &RetryConfig::query(), || {
            deadline(op, self.op_timeout, async move {
                let rows = sqlx::query(sql)
                    .bind(bind)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| map_sql_error(op, e))?;
                rows.iter()
                    .map(|row| row.try_get::<i64, _>(0).map_err(|e| map_sql_error(op, e)))
                    .collect()
            })
        })
        .await
    }
}

#[async_trait]
impl DurableStore for SqlStore {
    async fn get_shop(&self, id: i64) -> Result<Option<Shop>, StorageError> {
        retry("sql_get_shop", &RetryConfig::query(), || {
            deadline("sql_get_shop", self.op_timeout, async {
                let row = sqlx::query(
                    "SELECT id, name, type_id, address, avg_price, sold, score, open_hours FROM tb_shop WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sql_error("get_shop", e))?;
                row.as_ref().map(Self::shop_from_row).transpose()
            })
        })
        .await
    }

    async fn update_shop(&self, shop: &Shop) -> Result<bool, StorageError> {
        retry("sql_update_shop", &RetryConfig::query(), || {
            deadline("sql_update_shop", self.op_timeout, async {
                let result = sqlx::query(
                    "UPDATE tb_shop SET name = ?, type_id = ?, address = ?, avg_price = ?, sold = ?, score = ?, open_hours = ? WHERE id = ?",
                )
                .bind(&shop.name)
                .bind(shop.type_id)
                .bind(&shop.address)
                .bind(shop.avg_price)
                .bind(shop.sold)
                .bind(shop.score)
                .bind(&shop.open_hours)
                .bind(shop.id)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sql_error("update_shop", e))?;
                Ok(result.rows_affected() > 0)
            })
        })
        .await
    }

    async fn insert_seckill_voucher(&self, voucher: &SeckillVoucher) -> Result<(), StorageError> {
        deadline("sql_insert_voucher", self.op_timeout, async {
            sqlx::query(
                "INSERT INTO tb_seckill_voucher (voucher_id, stock, begin_time, end_time) VALUES (?, ?, ?, ?)",
            )
            .bind(voucher.voucher_id)
            .bind(voucher.stock)
            .bind(voucher.begin_time.timestamp_millis())
            .bind(voucher.end_time.timestamp_millis())
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| map_sql_error(&format!("seckill voucher {}", voucher.voucher_id), e))
        })
        .await
    }

    async fn get_seckill_voucher(&self, voucher_id: i64) -> Result<Option<SeckillVoucher>, StorageError> {
        retry("sql_get_voucher", &RetryConfig::query(), || {
            deadline("sql_get_voucher", self.op_timeout, async {
                let row = sqlx::query(
                    "SELECT voucher_id, stock, begin_time, end_time FROM tb_seckill_voucher WHERE voucher_id = ?",
                )
                .bind(voucher_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sql_error("get_seckill_voucher", e))?;

                Ok(row.map(|row| SeckillVoucher {
                    voucher_id,
                    stock: row.try_get("stock").unwrap_or(0),
                    begin_time: millis_to_time(row.try_get("begin_time").unwrap_or(0)),
                    end_time: millis_to_time(row.try_get("end_time").unwrap_or(0)),
                }))
            })
        })
        .await
    }

    async fn create_order_with_stock(&self, order: &VoucherOrder) -> Result<bool, StorageError> {
        // Not retried: the caller checks for the order before replaying.
        let what = format!("order for user {} voucher {}", order.user_id, order.voucher_id);
        deadline("sql_create_order", self.op_timeout, async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sql_error("begin create_order", e))?;

            let written = async {
                let updated = sqlx::query(
                    "UPDATE tb_seckill_voucher SET stock = stock - 1 WHERE voucher_id = ? AND stock > 0",
                )
                .bind(order.voucher_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sql_error("decrement_stock", e))?;
                if updated.rows_affected() != 1 {
                    return Ok(false);
                }

                sqlx::query(
                    "INSERT INTO tb_voucher_order (id, user_id, voucher_id, create_time) VALUES (?, ?, ?, ?)",
                )
                .bind(order.id)
                .bind(order.user_id)
                .bind(order.voucher_id)
                .bind(order.create_time.timestamp_millis())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sql_error(&what, e))?;
                Ok::<_, StorageError>(true)
            }
            .await;

            match written {
                Ok(true) => {
                    tx.commit().await.map_err(|e| map_sql_error("commit create_order", e))?;
                    Ok(true)
                }
                Ok(false) => {
                    tx.rollback().await.map_err(|e| map_sql_error("rollback create_order", e))?;
                    Ok(false)
                }
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(order_id = order.id, error = %rollback, "Rollback after failed order write failed");
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    async fn count_orders(&self, user_id: i64, voucher_id: i64) -> Result<u64, StorageError> {
        retry("sql_count_orders", &RetryConfig::query(), || {
            deadline("sql_count_orders", self.op_timeout, async {
                let row = sqlx::query("SELECT COUNT(*) FROM tb_voucher_order WHERE user_id = ? AND voucher_id = ?")
                    .bind(user_id)
                    .bind(voucher_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| map_sql_error("count_orders", e))?;
                let count: i64 = row.try_get(0).map_err(|e| map_sql_error("count_orders", e))?;
                Ok(count.max(0) as u64)
            })
        })
        .await
    }

    async fn insert_follow(&self, user_id: i64, follow_user_id: i64) -> Result<(), StorageError> {
        deadline("sql_insert_follow", self.op_timeout, async {
            sqlx::query("INSERT INTO tb_follow (user_id, follow_user_id, create_time) VALUES (?, ?, ?)")
                .bind(user_id)
                .bind(follow_user_id)
                .bind(Utc::now().timestamp_millis())
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|e| map_sql_error(&format!("follow {} -> {}", user_id, follow_user_id), e))
        })
        .await
    }

    async fn delete_follow(&self, user_id: i64, follow_user_id: i64) -> Result<bool, StorageError> {
        retry("sql_delete_follow", &RetryConfig::query(), || {
            deadline("sql_delete_follow", self.op_timeout, async {
                let result = sqlx::query("DELETE FROM tb_follow WHERE user_id = ? AND follow_user_id = ?")
                    .bind(user_id)
                    .bind(follow_user_id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sql_error("delete_follow", e))?;
                Ok(result.rows_affected() > 0)
            })
        })
        .await
    }

    async fn is_following(&self, user_id: i64, follow_user_id: i64) -> Result<bool, StorageError> {
        retry("sql_is_following", &RetryConfig::query(), || {
            deadline("sql_is_following", self.op_timeout, async {
                let row = sqlx::query("SELECT COUNT(*) FROM tb_follow WHERE user_id = ? AND follow_user_id = ?")
                    .bind(user_id)
                    .bind(follow_user_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| map_sql_error("is_following", e))?;
                let count: i64 = row.try_get(0).map_err(|e| map_sql_error("is_following", e))?;
                Ok(count > 0)
            })
        })
        .await
    }

    async fn follower_ids(&self, author_id: i64) -> Result<Vec<i64>, StorageError> {
        self.id_column(
            "sql_follower_ids",
            "SELECT user_id FROM tb_follow WHERE follow_user_id = ? ORDER BY user_id",
            author_id,
        )
        .await
    }

    async fn followee_ids(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        self.id_column(
            "sql_followee_ids",
            "SELECT follow_user_id FROM tb_follow WHERE user_id = ? ORDER BY follow_user_id",
            user_id,
        )
        .await
    }

    async fn insert_blog(&self, blog: &Blog) -> Result<i64, StorageError> {
        deadline("sql_insert_blog", self.op_timeout, async {
            let result = sqlx::query(
                "INSERT INTO tb_blog (user_id, shop_id, title, content, liked, create_time) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(blog.user_id)
            .bind(blog.shop_id)
            .bind(&blog.title)
            .bind(&blog.content)
            .bind(blog.liked)
            .bind(blog.create_time.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sql_error("insert_blog", e))?;
            result
                .last_insert_id()
                .ok_or_else(|| StorageError::Backend("insert_blog: driver returned no id".into()))
        })
        .await
    }

    async fn get_blog(&self, id: i64) -> Result<Option<Blog>, StorageError> {
        retry("sql_get_blog", &RetryConfig::query(), || {
            deadline("sql_get_blog", self.op_timeout, async {
                let row = sqlx::query(
                    "SELECT id, user_id, shop_id, title, content, liked, create_time FROM tb_blog WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sql_error("get_blog", e))?;
                row.as_ref().map(Self::blog_from_row).transpose()
            })
        })
        .await
    }

    async fn adjust_blog_likes(&self, id: i64, delta: i64) -> Result<bool, StorageError> {
        deadline("sql_adjust_likes", self.op_timeout, async {
            let result = sqlx::query("UPDATE tb_blog SET liked = liked + ? WHERE id = ?")
                .bind(delta)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sql_error("adjust_blog_likes", e))?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }
}
