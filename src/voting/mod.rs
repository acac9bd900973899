pub mod ledger;
pub mod plurality;

use serde::Serialize;

// Generic structure for poll results
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollResults {
    pub winner: Option<VoteCount>,   // None when nobody voted
    pub total_votes: u64,
    pub ranked: Vec<VoteCount>,      // Highest first, ties in option order
}

// One option's standing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteCount {
    pub option_index: usize,
    pub text: String,
    pub votes: u64,
}
