// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Follow graph over the durable store. It supplies the feed's fan-out set.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::context::UserIdentity;
use crate::storage::traits::{DurableStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    Followed,
    Unfollowed,
    AlreadyFollowing,
    NotFollowing,
    SelfFollow,
}

pub struct FollowService {
    durable: Arc<dyn DurableStore>,
}

impl FollowService {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self { durable }
    }

    /// Follow (`follow = true`) or unfollow `target_id` as `user`.
    pub async fn follow(&self, user: &UserIdentity, target_id: i64, follow: bool) -> Result<FollowOutcome, StorageError> {
        if user.id == target_id {
            return Ok(FollowOutcome::SelfFollow);
        }

        let outcome = if follow {
            match self.durable.insert_follow(user.id, target_id).await {
                Ok(()) => FollowOutcome::Followed,
                Err(StorageError::Duplicate(_)) => FollowOutcome::AlreadyFollowing,
                Err(e) => return Err(e),
            }
        } else if self.durable.delete_follow(user.id, target_id).await? {
            FollowOutcome::Unfollowed
        } else {
            FollowOutcome::NotFollowing
        };

        debug!(user_id = user.id, target_id, ?outcome, "Follow edge changed");
        Ok(outcome)
    }

    pub async fn is_following(&self, user: &UserIdentity, target_id: i64) -> Result<bool, StorageError> {
        self.durable.is_following(user.id, target_id).await
    }

    /// Users followed by both `user` and `other_id`, ascending.
    pub async fn common_follows(&self, user: &UserIdentity, other_id: i64) -> Result<Vec<i64>, StorageError> {
        let mine: BTreeSet<i64> = self.durable.followee_ids(user.id).await?.into_iter().collect();
        let theirs = self.durable.followee_ids(other_id).await?;
        let common: BTreeSet<i64> = theirs.into_iter().filter(|id| mine.contains(id)).collect();
        Ok(common.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryDurableStore;

    #[tokio::test]
    async fn test_follow_unfollow_cycle() {
        let service = FollowService::new(Arc::new(InMemoryDurableStore::new()));
        let alice = UserIdentity::new(1);

        assert_eq!(service.follow(&alice, 2, true).await.unwrap(), FollowOutcome::Followed);
        assert_eq!(service.follow(&alice, 2, true).await.unwrap(), FollowOutcome::AlreadyFollowing);
        assert!(service.is_following(&alice, 2).await.unwrap());

        assert_eq!(service.follow(&alice, 2, false).await.unwrap(), FollowOutcome::Unfollowed);
        assert_eq!(service.follow(&alice, 2, false).await.unwrap(), FollowOutcome::NotFollowing);
        assert_eq!(service.follow(&alice, 1, true).await.unwrap(), FollowOutcome::SelfFollow);
    }

    #[tokio::test]
    async fn test_common_follows() {
        let service = FollowService::new(Arc::new(InMemoryDurableStore::new()));
        let a = UserIdentity::new(1);
        let b = UserIdentity::new(2);
        for target in [10, 11, 12] {
            service.follow(&a, target, true).await.unwrap();
        }
        for target in [11, 12, 13] {
            service.follow(&b, target, true).await.unwrap();
        }
        assert_eq!(service.common_follows(&a, 2).await.unwrap(), vec![11, 12]);
        assert!(service.common_follows(&a, 99).await.unwrap().is_empty());
    }
}
