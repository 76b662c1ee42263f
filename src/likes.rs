// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Blog likes: `blog:liked:<id>` holds `user → like millis`, the durable
//! `liked` column holds the count.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::context::UserIdentity;
use crate::keys;
use crate::storage::traits::{DurableStore, KvStore, StorageError};

pub struct LikeService {
    kv: Arc<dyn KvStore>,
    durable: Arc<dyn DurableStore>,
}

impl LikeService {
    pub fn new(kv: Arc<dyn KvStore>, durable: Arc<dyn DurableStore>) -> Self {
        Self { kv, durable }
    }

    /// Like if not yet liked, otherwise unlike. Returns whether `user` likes it afterwards.
    pub async fn toggle_like(&self, blog_id: i64, user: &UserIdentity) -> Result<bool, StorageError> {
        let key = keys::blog_liked(blog_id);
        let member = user.id.to_string();

        if self.kv.zscore(&key, &member).await?.is_none() {
            // The counter moves only for the caller whose zadd/zrem changed the set.
            if !self
                .kv
                .zadd(&key, &member, Utc::now().timestamp_millis() as f64)
                .await?
            {
                return Ok(true);
            }
            if !self.durable.adjust_blog_likes(blog_id, 1).await? {
                self.kv.zrem(&key, &member).await?;
                return Err(StorageError::Invariant(format!("blog {} does not exist", blog_id)));
            }
            Ok(true)
        } else {
            if !self.kv.zrem(&key, &member).await? {
                return Ok(false);
            }
            if !self.durable.adjust_blog_likes(blog_id, -1).await? {
                warn!(blog_id, "Unlike on a blog missing from the durable store");
            }
            Ok(false)
        }
    }

    pub async fn is_liked(&self, blog_id: i64, user: &UserIdentity) -> Result<bool, StorageError> {
        Ok(self
            .kv
            .zscore(&keys::blog_liked(blog_id), &user.id.to_string())
            .await?
            .is_some())
    }

    /// The first `n` users to like the blog, earliest first.
    pub async fn top_likers(&self, blog_id: i64, n: usize) -> Result<Vec<i64>, StorageError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let members = self.kv.zrange(&keys::blog_liked(blog_id), 0, n as isize - 1).await?;
        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Blog;
    use crate::storage::memory::{InMemoryDurableStore, InMemoryKvStore};

    #[tokio::test]
    async fn test_toggle_and_top_likers() {
        let kv = Arc::new(InMemoryKvStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        let blog_id = durable.insert_blog(&Blog::draft(1, "t", "c")).await.unwrap();
        let service = LikeService::new(kv, durable.clone());

        for user in [5, 6, 7] {
            assert!(service.toggle_like(blog_id, &UserIdentity::new(user)).await.unwrap());
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(durable.get_blog(blog_id).await.unwrap().unwrap().liked, 3);
        assert_eq!(service.top_likers(blog_id, 2).await.unwrap(), vec![5, 6]);

        assert!(!service.toggle_like(blog_id, &UserIdentity::new(5)).await.unwrap());
        assert!(!service.is_liked(blog_id, &UserIdentity::new(5)).await.unwrap());
        assert_eq!(durable.get_blog(blog_id).await.unwrap().unwrap().liked, 2);
        assert_eq!(service.top_likers(blog_id, 5).await.unwrap(), vec![6, 7]);
    }

    #[tokio::test]
    async fn test_like_on_missing_blog_fails() {
        let service = LikeService::new(Arc::new(InMemoryKvStore::new()), Arc::new(InMemoryDurableStore::new()));
        assert!(service.toggle_like(404, &UserIdentity::new(1)).await.is_err());
        assert!(!service.is_liked(404, &UserIdentity::new(1)).await.unwrap());
        assert!(service.top_likers(404, 0).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_toggles_keep_counter_in_step() {
        let kv = Arc::new(InMemoryKvStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        let blog_id = durable.insert_blog(&Blog::draft(1, "t", "c")).await.unwrap();
        let service = Arc::new(LikeService::new(kv, durable.clone()));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.toggle_like(blog_id, &UserIdentity::new(9)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let liked = service.is_liked(blog_id, &UserIdentity::new(9)).await.unwrap();
        assert_eq!(durable.get_blog(blog_id).await.unwrap().unwrap().liked, i64::from(liked));
    }
}
