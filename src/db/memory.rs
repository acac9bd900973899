use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::PollStore;
use crate::error::StoreError;
use crate::models::{Poll, PollOption};

/// Process-local store. Same contract as the SQLite store, including
/// version checks, so the manager cannot tell them apart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    polls: RwLock<HashMap<String, Poll>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Poll>>, StoreError> {
        self.polls.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Poll>>, StoreError> {
        self.polls.write().map_err(|_| StoreError::Poisoned)
    }
}

fn newest_first(mut polls: Vec<Poll>) -> Vec<Poll> {
    polls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    polls
}

#[async_trait]
impl PollStore for MemoryStore {
    async fn insert(&self, poll: &Poll) -> Result<(), StoreError> {
        let mut polls = self.write()?;
        if polls.contains_key(&poll.id) {
            return Err(StoreError::Conflict(poll.id.clone()));
        }
        polls.insert(poll.id.clone(), poll.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Poll>, StoreError> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn update_vote_state(
        &self,
        id: &str,
        expected_version: i64,
        options: &[PollOption],
        voter: &str,
    ) -> Result<Poll, StoreError> {
        let mut polls = self.write()?;
        let poll = polls
            .get_mut(id)
            .filter(|p| p.version == expected_version && !p.voters.contains(voter))
            .ok_or_else(|| StoreError::Conflict(id.to_string()))?;

        poll.options = options.to_vec();
        poll.voters.insert(voter.to_string());
        poll.version += 1;
        Ok(poll.clone())
    }

    async fn mark_ended(&self, id: &str, ended_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut polls = self.write()?;
        match polls.get_mut(id) {
            Some(poll) if poll.active => {
                poll.active = false;
                poll.ended_at = Some(ended_at);
                poll.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active(&self) -> Result<Vec<Poll>, StoreError> {
        let polls = self.read()?.values().filter(|p| p.active).cloned().collect();
        Ok(newest_first(polls))
    }

    async fn list_ended(&self, limit: usize) -> Result<Vec<Poll>, StoreError> {
        let mut ended: Vec<Poll> = self.read()?.values().filter(|p| !p.active).cloned().collect();
        ended.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        ended.truncate(limit);
        Ok(ended)
    }

    async fn list_by_creator(&self, creator: &str) -> Result<Vec<Poll>, StoreError> {
        let polls = self
            .read()?
            .values()
            .filter(|p| p.created_by == creator)
            .cloned()
            .collect();
        Ok(newest_first(polls))
    }

    async fn purge_ended(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut polls = self.write()?;
        let before = polls.len();
        polls.retain(|_, poll| match (poll.active, poll.ended_at) {
            (false, Some(ended_at)) => ended_at + poll.tier.retention() >= now,
            _ => true,
        });
        Ok((before - polls.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ANONYMOUS, Tier};
    use chrono::Duration;

    fn poll(tier: Tier) -> Poll {
        Poll::new(
            "Q?".to_string(),
            vec!["a".to_string(), "b".to_string()],
            1,
            ANONYMOUS.to_string(),
            tier,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn duplicate_id_insert_conflicts() {
        let store = MemoryStore::new();
        let p = poll(Tier::Default);
        store.insert(&p).await.unwrap();
        assert!(matches!(store.insert(&p).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let store = MemoryStore::new();
        let p = poll(Tier::Default);
        store.insert(&p).await.unwrap();

        let mut options = p.options.clone();
        options[0].votes = 1;
        let updated = store.update_vote_state(&p.id, 0, &options, "A").await.unwrap();
        assert_eq!(updated.version, 1);
        assert!(updated.voters.contains("A"));

        let stale = store.update_vote_state(&p.id, 0, &options, "B").await;
        assert!(matches!(stale, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn mark_ended_flips_once() {
        let store = MemoryStore::new();
        let p = poll(Tier::Default);
        store.insert(&p).await.unwrap();
        assert!(store.mark_ended(&p.id, Utc::now()).await.unwrap());
        assert!(!store.mark_ended(&p.id, Utc::now()).await.unwrap());
        assert!(!store.mark_ended("missing", Utc::now()).await.unwrap());
        assert!(store.list_active().await.unwrap().is_empty());
        assert_eq!(store.list_ended(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purge_respects_tier_retention() {
        let store = MemoryStore::new();
        let ended_at = Utc::now();
        let default = poll(Tier::Default);
        let vip = poll(Tier::Vip);
        let active = poll(Tier::Default);
        for p in [&default, &vip, &active] {
            store.insert(p).await.unwrap();
        }
        store.mark_ended(&default.id, ended_at).await.unwrap();
        store.mark_ended(&vip.id, ended_at).await.unwrap();

        let purged = store.purge_ended(ended_at + Duration::days(8)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(&default.id).await.unwrap().is_none());
        assert!(store.get(&vip.id).await.unwrap().is_some());
        assert!(store.get(&active.id).await.unwrap().is_some());

        let purged = store.purge_ended(ended_at + Duration::days(31)).await.unwrap();
        assert_eq!(purged, 1);
    }
}
