// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push-model timeline.
//!
//! Publishing writes `item → publish millis` into every follower's
//! `feed:<user>` sorted set. Reading scrolls that set by descending score with
//! a `(max_score, offset)` cursor, where `offset` counts entries at exactly
//! `max_score` already returned. Ties of any length page through exactly once.

pub mod follow;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::context::UserIdentity;
use crate::keys;
use crate::model::Blog;
use crate::storage::traits::{DurableStore, KvStore, ScoredMember, StorageError};

pub use follow::{FollowOutcome, FollowService};

/// One page of a timeline plus the cursor for the next call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollPage {
    pub items: Vec<i64>,
    pub next_max_score: i64,
    pub next_offset: usize,
}

impl ScrollPage {
    /// An empty page means the timeline is exhausted below the cursor.
    pub fn is_end(&self) -> bool {
        self.items.is_empty()
    }
}

const DEFAULT_PAGE_SIZE: usize = 10;

pub struct FeedService {
    kv: Arc<dyn KvStore>,
    durable: Arc<dyn DurableStore>,
    page_size: usize,
}

impl FeedService {
    pub fn new(kv: Arc<dyn KvStore>, durable: Arc<dyn DurableStore>) -> Self {
        Self {
            kv,
            durable,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Page size used by [`scroll_default`](Self::scroll_default). Zero is clamped to one.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fan `item_id` out to every follower of `author_id`, scored now.
    /// Returns how many timelines received it.
    pub async fn publish(&self, author_id: i64, item_id: i64) -> Result<usize, StorageError> {
        self.publish_at(author_id, item_id, Utc::now().timestamp_millis()).await
    }

    /// Fan-out with an explicit score. A follower whose write fails is skipped.
    #[instrument(skip(self))]
    pub async fn publish_at(&self, author_id: i64, item_id: i64, score_millis: i64) -> Result<usize, StorageError> {
        let followers = self.durable.follower_ids(author_id).await?;
        let member = item_id.to_string();
        let mut delivered = 0;

        for follower in &followers {
            match self.kv.zadd(&keys::feed(*follower), &member, score_millis as f64).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(follower, item_id, error = %e, "Feed delivery failed");
                    crate::metrics::record_error("cache", "feed_publish", "delivery");
                }
            }
        }

        crate::metrics::record_feed_fanout(delivered);
        debug!(followers = followers.len(), delivered, "Item fanned out");
        Ok(delivered)
    }

    /// Persist a blog as `user` and push it to their followers. Returns the blog id.
    pub async fn publish_blog(&self, user: &UserIdentity, mut blog: Blog) -> Result<i64, StorageError> {
        blog.user_id = user.id;
        let id = self.durable.insert_blog(&blog).await?;
        self.publish(user.id, id).await?;
        Ok(id)
    }

    /// Read up to `page_size` items with score ≤ `max_score`, skipping the
    /// first `offset` of them that score exactly `max_score`.
    pub async fn scroll(
        &self,
        user_id: i64,
        max_score: i64,
        offset: usize,
        page_size: usize,
    ) -> Result<ScrollPage, StorageError> {
        let entries = self
            .kv
            .zrevrange_by_score_with_scores(&keys::feed(user_id), max_score as f64, 0.0, offset, page_size)
            .await?;
        Ok(next_page(&entries, max_score, offset))
    }

    /// [`scroll`](Self::scroll) with the configured page size.
    pub async fn scroll_default(&self, user_id: i64, max_score: i64, offset: usize) -> Result<ScrollPage, StorageError> {
        self.scroll(user_id, max_score, offset, self.page_size).await
    }
}

fn next_page(entries: &[ScoredMember], max_score: i64, offset: usize) -> ScrollPage {
    let Some(last) = entries.last() else {
        return ScrollPage {
            items: Vec::new(),
            next_max_score: max_score,
            next_offset: offset,
        };
    };

    let min_score = last.score as i64;
    let tail = entries
        .iter()
        .rev()
        .take_while(|entry| entry.score as i64 == min_score)
        .count();

    // A page that never left max_score must keep counting from the old offset.
    let next_offset = if min_score == max_score { offset + tail } else { tail };

    let items = entries
        .iter()
        .filter_map(|entry| match entry.member.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(member = %entry.member, "Non-numeric feed member skipped");
                None
            }
        })
        .collect();

    ScrollPage {
        items,
        next_max_score: min_score,
        next_offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{InMemoryDurableStore, InMemoryKvStore};

    async fn seeded(scores: &[(i64, i64)]) -> FeedService {
        let kv = Arc::new(InMemoryKvStore::new());
        for (item, score) in scores {
            kv.zadd("feed:1", &item.to_string(), *score as f64).await.unwrap();
        }
        FeedService::new(kv, Arc::new(InMemoryDurableStore::new()))
    }

    async fn drain(feed: &FeedService, page_size: usize) -> Vec<i64> {
        let mut seen = Vec::new();
        let (mut max, mut offset) = (i64::MAX, 0);
        for _ in 0..100 {
            let page = feed.scroll(1, max, offset, page_size).await.unwrap();
            if page.is_end() {
                return seen;
            }
            seen.extend(page.items);
            max = page.next_max_score;
            offset = page.next_offset;
        }
        panic!("scroll did not terminate");
    }

    #[tokio::test]
    async fn test_ties_split_across_pages() {
        let feed = seeded(&[(1, 5), (2, 5), (3, 4), (4, 4), (5, 3), (6, 3), (7, 1)]).await;

        let first = feed.scroll(1, 5, 0, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!((first.next_max_score, first.next_offset), (5, 2));

        let second = feed.scroll(1, first.next_max_score, first.next_offset, 2).await.unwrap();
        assert_eq!(second.items, vec![4, 3]);
        assert_eq!((second.next_max_score, second.next_offset), (4, 2));
    }

    #[tokio::test]
    async fn test_run_longer_than_page_terminates() {
        let feed = seeded(&[(1, 9), (2, 9), (3, 9), (4, 9), (5, 9), (6, 2)]).await;
        let mut seen = drain(&feed, 2).await;
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_empty_feed_keeps_cursor() {
        let feed = seeded(&[]).await;
        let page = feed.scroll(1, 1_000, 3, 10).await.unwrap();
        assert!(page.is_end());
        assert_eq!((page.next_max_score, page.next_offset), (1_000, 3));
    }

    #[tokio::test]
    async fn test_publish_reaches_followers_only() {
        let kv = Arc::new(InMemoryKvStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.insert_follow(2, 1).await.unwrap();
        durable.insert_follow(3, 1).await.unwrap();
        let feed = FeedService::new(kv.clone(), durable);

        let blog_id = feed
            .publish_blog(&UserIdentity::new(1), Blog::draft(0, "Dumplings", "Best in town"))
            .await
            .unwrap();

        for follower in [2, 3] {
            let page = feed.scroll(follower, i64::MAX, 0, 10).await.unwrap();
            assert_eq!(page.items, vec![blog_id]);
        }
        assert!(feed.scroll(1, i64::MAX, 0, 10).await.unwrap().is_end());
    }

    #[tokio::test]
    async fn test_scroll_default_uses_configured_page_size() {
        let feed = seeded(&[(1, 5), (2, 4), (3, 3), (4, 2)]).await.with_page_size(3);
        let page = feed.scroll_default(1, 5, 0).await.unwrap();
        assert_eq!(page.items, vec![1, 2, 3]);

        let clamped = seeded(&[]).await.with_page_size(0);
        assert_eq!(clamped.page_size(), 1);
    }

    #[test]
    fn test_next_page_counts_trailing_run_only() {
        let entries = vec![
            ScoredMember::new("1", 7.0),
            ScoredMember::new("2", 6.0),
            ScoredMember::new("3", 6.0),
        ];
        let page = next_page(&entries, 8, 0);
        assert_eq!(page.items, vec![1, 2, 3]);
        assert_eq!((page.next_max_score, page.next_offset), (6, 2));
    }
}
