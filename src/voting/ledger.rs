//! One-vote-per-identity bookkeeping.
//!
//! The ledger is the voter identity set plus the per-option counters of a
//! [`Poll`]. Every accepted vote adds exactly one identity and bumps exactly one
//! counter, so `sum(votes) == voters.len()` holds after any sequence of calls.
//! Callers serialize access per poll; the ledger itself is plain data.

use crate::error::PollError;
use crate::models::Poll;

/// Check-and-record a single vote. On error the poll is left untouched.
pub fn record_vote(poll: &mut Poll, option_index: i64, voter: &str) -> Result<(), PollError> {
    if poll.voters.contains(voter) {
        return Err(PollError::DuplicateVote);
    }

    let index = usize::try_from(option_index)
        .ok()
        .filter(|i| *i < poll.options.len())
        .ok_or(PollError::InvalidOption(option_index))?;

    poll.voters.insert(voter.to_string());
    poll.options[index].votes += 1;

    debug_assert!(is_consistent(poll));
    Ok(())
}

pub fn is_consistent(poll: &Poll) -> bool {
    poll.total_votes() == poll.voters.len() as u64
}
