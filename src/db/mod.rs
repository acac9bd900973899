//! Poll persistence.
//!
//! [`PollStore`] is the only way the lifecycle manager touches stored polls.
//! Writes that change vote state or the active flag are conditional on the
//! record's `version`, so several processes can share one backend: whoever
//! loses a race gets [`StoreError::Conflict`] and re-reads.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::StoreError;
use crate::models::{Poll, PollOption};

#[async_trait]
pub trait PollStore: Send + Sync {
    /// Fails with `Conflict` if a poll with the same id already exists.
    async fn insert(&self, poll: &Poll) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Poll>, StoreError>;

    /// Replace the counters and append `voter`, provided the stored version
    /// still equals `expected_version`. Returns the updated poll.
    async fn update_vote_state(
        &self,
        id: &str,
        expected_version: i64,
        options: &[PollOption],
        voter: &str,
    ) -> Result<Poll, StoreError>;

    /// Flip `active` to false. Returns true only for the caller that
    /// performed the transition.
    async fn mark_ended(&self, id: &str, ended_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Polls whose stored flag is still active, newest first.
    async fn list_active(&self) -> Result<Vec<Poll>, StoreError>;

    /// Ended polls, most recently ended first.
    async fn list_ended(&self, limit: usize) -> Result<Vec<Poll>, StoreError>;

    /// Every poll created by `creator`, newest first.
    async fn list_by_creator(&self, creator: &str) -> Result<Vec<Poll>, StoreError>;

    /// Delete ended polls whose tier retention has elapsed. Returns the count removed.
    async fn purge_ended(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

// Shapes an option may have been stored in by older schema versions
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredOption {
    Text(String),
    Counted {
        text: String,
        #[serde(default)]
        votes: Option<u64>,
    },
}

/// Turn stored option JSON plus the legacy votes-by-text map into the single
/// canonical `{text, votes}` list. An embedded count wins over the map.
pub(crate) fn normalize_options(
    options_json: &str,
    legacy_votes_json: Option<&str>,
) -> Result<Vec<PollOption>, serde_json::Error> {
    let stored: Vec<StoredOption> = serde_json::from_str(options_json)?;
    let legacy: HashMap<String, u64> = match legacy_votes_json {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
        _ => HashMap::new(),
    };

    Ok(stored
        .into_iter()
        .map(|option| {
            let (text, embedded) = match option {
                StoredOption::Text(text) => (text, None),
                StoredOption::Counted { text, votes } => (text, votes),
            };
            let votes = embedded
                .or_else(|| legacy.get(&text).copied())
                .unwrap_or(0);
            PollOption { text, votes }
        })
        .collect())
}
