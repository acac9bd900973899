//! Poll lifecycle: creation, voting, expiry and read projections.
//!
//! [`PollManager`] is the only component that mutates polls. Mutations of a
//! given poll (votes and the end-of-poll transition) run under a per-poll
//! async lock, and every store write is additionally version-checked so other
//! processes sharing the store are tolerated. Tallies are published while the
//! lock is held, which makes the broadcast order equal to the commit order.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

use crate::clock::{Clock, SystemClock};
use crate::db::PollStore;
use crate::error::{PollError, StoreError};
use crate::live::Broadcaster;
use crate::models::{
    ANONYMOUS, MAX_DURATION_MINUTES, MIN_DURATION_MINUTES, NewPoll, Poll, Tally,
};
use crate::tasks::expiry::ExpiryScheduler;
use crate::voting::ledger;

/// Attempts at a version-checked write before reporting `StoreConflict`.
pub const MAX_STORE_RETRIES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndTrigger {
    Timer,
    Lazy,
    Sweep,
}

/// Polls of one creator, split by state.
#[derive(Debug, Clone, Default)]
pub struct CreatorPolls {
    pub active: Vec<Poll>,
    pub history: Vec<Poll>,
}

#[derive(Clone)]
pub struct PollManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn PollStore>,
    broadcaster: Broadcaster,
    scheduler: ExpiryScheduler,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PollManager {
    pub fn new(store: Arc<dyn PollStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn PollStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                broadcaster: Broadcaster::default(),
                scheduler: ExpiryScheduler::new(),
                clock,
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    pub fn scheduler(&self) -> &ExpiryScheduler {
        &self.inner.scheduler
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn lock_for(&self, poll_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(poll_id.to_string()).or_default())
    }

    // Once a poll has ended nothing mutates it again, so its lock can go
    fn release_lock(&self, poll_id: &str) {
        let mut locks = self.inner.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(poll_id);
    }

    // Drop lock entries whose poll no longer exists or has ended
    async fn prune_locks(&self) -> Result<(), PollError> {
        let ids: Vec<String> = {
            let locks = self.inner.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.keys().cloned().collect()
        };
        for id in ids {
            if !self.inner.store.get(&id).await?.is_some_and(|p| p.active) {
                self.release_lock(&id);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.inner.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn create_poll(&self, request: NewPoll) -> Result<Poll, PollError> {
        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(PollError::validation("question is required"));
        }

        let options: Vec<String> = request
            .options
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        if options.len() < 2 {
            return Err(PollError::validation("at least two options are required"));
        }

        if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&request.duration_minutes) {
            return Err(PollError::validation(format!(
                "duration must be between {MIN_DURATION_MINUTES} and {MAX_DURATION_MINUTES} minutes"
            )));
        }

        let created_by = request
            .created_by
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| ANONYMOUS.to_string());
        let tier = request.tier.unwrap_or_default();

        // Ids are short, so a collision is unlikely but not impossible
        let mut attempt = 0;
        let poll = loop {
            let poll = Poll::new(
                question.clone(),
                options.clone(),
                request.duration_minutes,
                created_by.clone(),
                tier,
                self.now(),
            );
            match self.inner.store.insert(&poll).await {
                Ok(()) => break poll,
                Err(StoreError::Conflict(id)) if attempt + 1 < MAX_STORE_RETRIES => {
                    warn!("Poll id {} already taken, generating another", id);
                    attempt += 1;
                }
                Err(StoreError::Conflict(id)) => return Err(PollError::StoreConflict(id)),
                Err(e) => return Err(e.into()),
            }
        };

        self.arm_expiry(&poll);
        info!(
            "Created poll {} ({} options, {} min, tier {}) by {}",
            poll.id,
            poll.options.len(),
            request.duration_minutes,
            poll.tier,
            poll.created_by
        );
        Ok(poll)
    }

    fn arm_expiry(&self, poll: &Poll) {
        let delay = (poll.expires_at() - self.now())
            .to_std()
            .unwrap_or_default();
        let manager = self.clone();
        let poll_id = poll.id.clone();
        self.inner.scheduler.arm(&poll.id, delay, move || async move {
            if let Err(e) = manager.end_poll(&poll_id, EndTrigger::Timer).await {
                error!("Failed to end poll {} on timer: {}", poll_id, e);
            }
        });
    }

    /// Fetch a poll, ending it first if its window has passed.
    pub async fn get_poll(&self, poll_id: &str) -> Result<Poll, PollError> {
        let poll = self
            .inner
            .store
            .get(poll_id)
            .await?
            .ok_or_else(|| PollError::NotFound(poll_id.to_string()))?;

        if poll.active && poll.is_past_expiry(self.now()) {
            return self.reconcile(poll_id).await;
        }
        Ok(poll)
    }

    // Lazy expiry: end the poll (if nobody else has) and return fresh state
    async fn reconcile(&self, poll_id: &str) -> Result<Poll, PollError> {
        self.end_poll(poll_id, EndTrigger::Lazy).await?;
        self.inner
            .store
            .get(poll_id)
            .await?
            .ok_or_else(|| PollError::NotFound(poll_id.to_string()))
    }

    /// Flip a poll to ended and publish the terminal event. Returns true only
    /// for the call that performed the transition; every other call is a no-op.
    pub async fn end_poll(&self, poll_id: &str, trigger: EndTrigger) -> Result<bool, PollError> {
        let lock = self.lock_for(poll_id);
        let _guard = lock.lock().await;
        self.end_poll_locked(poll_id, trigger).await
    }

    async fn end_poll_locked(&self, poll_id: &str, trigger: EndTrigger) -> Result<bool, PollError> {
        let now = self.now();
        let poll = match self.inner.store.get(poll_id).await? {
            Some(poll) => poll,
            None => {
                self.release_lock(poll_id);
                return Ok(false);
            }
        };

        if !poll.active {
            self.release_lock(poll_id);
            return Ok(false);
        }
        // The timer fires at expires_at by construction; other paths check the clock
        if trigger != EndTrigger::Timer && !poll.is_past_expiry(now) {
            return Ok(false);
        }

        if !self.inner.store.mark_ended(poll_id, now).await? {
            // Another replica got there first
            self.release_lock(poll_id);
            return Ok(false);
        }

        if trigger != EndTrigger::Timer {
            self.inner.scheduler.cancel(poll_id);
        }
        let reached = self.inner.broadcaster.publish_ended(poll_id);
        self.release_lock(poll_id);
        info!(
            "Poll {} ended ({:?}) with {} votes, notified {} viewers",
            poll_id,
            trigger,
            poll.voters.len(),
            reached
        );
        Ok(true)
    }

    /// Record one vote from `voter` for option `option_index` and push the
    /// new tally to live subscribers.
    pub async fn cast_vote(
        &self,
        poll_id: &str,
        option_index: i64,
        voter: &str,
    ) -> Result<Tally, PollError> {
        let lock = self.lock_for(poll_id);
        let _guard = lock.lock().await;

        for attempt in 1..=MAX_STORE_RETRIES {
            let mut poll = match self.inner.store.get(poll_id).await? {
                Some(poll) => poll,
                None => {
                    self.release_lock(poll_id);
                    return Err(PollError::NotFound(poll_id.to_string()));
                }
            };

            if poll.active && poll.is_past_expiry(self.now()) {
                self.end_poll_locked(poll_id, EndTrigger::Lazy).await?;
                return Err(PollError::PollEnded);
            }
            if !poll.active {
                self.release_lock(poll_id);
                return Err(PollError::PollEnded);
            }

            if let Err(e) = ledger::record_vote(&mut poll, option_index, voter) {
                debug!("Rejected vote on poll {} from {}: {}", poll_id, voter, e);
                return Err(e);
            }

            match self
                .inner
                .store
                .update_vote_state(poll_id, poll.version, &poll.options, voter)
                .await
            {
                Ok(updated) => {
                    let tally = updated.tally();
                    self.inner.broadcaster.publish_tally(poll_id, tally.clone());
                    debug!(
                        "Vote on poll {} for option {} ({} total)",
                        poll_id, option_index, tally.total_votes
                    );
                    return Ok(tally);
                }
                Err(StoreError::Conflict(_)) => {
                    warn!(
                        "Write conflict voting on poll {} (attempt {}/{})",
                        poll_id, attempt, MAX_STORE_RETRIES
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        error!("Giving up on vote for poll {} after {} conflicts", poll_id, MAX_STORE_RETRIES);
        Err(PollError::StoreConflict(poll_id.to_string()))
    }

    // End every stored-active poll whose window has passed, returning the
    // polls as they were listed with those that ended dropped.
    async fn reconcile_active(&self, trigger: EndTrigger) -> Result<(Vec<Poll>, usize), PollError> {
        let now = self.now();
        let mut still_active = Vec::new();
        let mut ended = 0;
        for poll in self.inner.store.list_active().await? {
            if poll.is_past_expiry(now) {
                if self.end_poll(&poll.id, trigger).await? {
                    ended += 1;
                }
            } else {
                still_active.push(poll);
            }
        }
        Ok((still_active, ended))
    }

    pub async fn list_active(&self) -> Result<Vec<Poll>, PollError> {
        Ok(self.reconcile_active(EndTrigger::Lazy).await?.0)
    }

    pub async fn list_ended(&self, limit: usize) -> Result<Vec<Poll>, PollError> {
        self.reconcile_active(EndTrigger::Lazy).await?;
        Ok(self.inner.store.list_ended(limit).await?)
    }

    pub async fn list_by_creator(&self, creator: &str) -> Result<CreatorPolls, PollError> {
        let now = self.now();
        let mut polls = CreatorPolls::default();
        for poll in self.inner.store.list_by_creator(creator).await? {
            let poll = if poll.active && poll.is_past_expiry(now) {
                self.reconcile(&poll.id).await?
            } else {
                poll
            };
            if poll.active {
                polls.active.push(poll);
            } else {
                polls.history.push(poll);
            }
        }
        Ok(polls)
    }

    /// Start-up recovery: end what expired while we were down and re-arm
    /// timers for everything else. Returns (ended, re-armed).
    pub async fn recover(&self) -> Result<(usize, usize), PollError> {
        let (active, ended) = self.reconcile_active(EndTrigger::Sweep).await?;
        for poll in &active {
            self.arm_expiry(poll);
        }
        Ok((ended, active.len()))
    }

    /// Periodic housekeeping: end overdue polls then drop ended polls past
    /// their tier's retention. Returns (ended, purged).
    pub async fn sweep(&self) -> Result<(usize, u64), PollError> {
        let (_, ended) = self.reconcile_active(EndTrigger::Sweep).await?;
        let purged = self.inner.store.purge_ended(self.now()).await?;
        self.prune_locks().await?;
        Ok((ended, purged))
    }
}
