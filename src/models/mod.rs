use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const ANONYMOUS: &str = "anonymous";
pub const MIN_DURATION_MINUTES: i64 = 1;
pub const MAX_DURATION_MINUTES: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    pub created_by: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub active: bool,
    pub ended_at: Option<DateTime<Utc>>,
    pub voters: BTreeSet<String>,
    // Bumped by the store on every write; used for compare-and-swap
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub text: String,
    pub votes: u64,
}

/// Creator classification. Only affects how long an ended poll is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Default,
    Premium,
    Vip,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Default, Tier::Premium, Tier::Vip];

    pub fn retention(self) -> Duration {
        match self {
            Tier::Default => Duration::days(7),
            Tier::Premium => Duration::days(14),
            Tier::Vip => Duration::days(30),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Default => "default",
            Tier::Premium => "premium",
            Tier::Vip => "vip",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Tier::Default),
            "premium" => Ok(Tier::Premium),
            "vip" => Ok(Tier::Vip),
            other => Err(format!("unknown user type: {other}")),
        }
    }
}

/// Snapshot pushed to live subscribers after each accepted vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub options: Vec<PollOption>,
    #[serde(rename = "totalVotes")]
    pub total_votes: u64,
}

// Validated creation input
#[derive(Debug, Clone)]
pub struct NewPoll {
    pub question: String,
    pub options: Vec<String>,
    pub duration_minutes: i64,
    pub created_by: Option<String>,
    pub tier: Option<Tier>,
}

impl Poll {
    pub fn new(
        question: String,
        options: Vec<String>,
        duration_minutes: i64,
        created_by: String,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Self {
        let options = options
            .into_iter()
            .map(|text| PollOption { text, votes: 0 })
            .collect();

        Self {
            id: generate_poll_id(),
            question,
            options,
            created_by,
            tier,
            created_at: now,
            duration_ms: duration_minutes * 60 * 1000,
            active: true,
            ended_at: None,
            voters: BTreeSet::new(),
            version: 0,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::milliseconds(self.duration_ms)
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    // Milliseconds left in the voting window, 0 once ended
    pub fn time_remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        if !self.active {
            return 0;
        }
        (self.expires_at() - now).num_milliseconds().max(0)
    }

    pub fn total_votes(&self) -> u64 {
        self.options.iter().map(|o| o.votes).sum()
    }

    pub fn tally(&self) -> Tally {
        Tally {
            options: self.options.clone(),
            total_votes: self.voters.len() as u64,
        }
    }
}

// Short opaque token: first 8 hex chars of a v4 uuid
pub fn generate_poll_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: DateTime<Utc>) -> Poll {
        Poll::new(
            "Coffee or Tea?".to_string(),
            vec!["Coffee".to_string(), "Tea".to_string()],
            1,
            ANONYMOUS.to_string(),
            Tier::Default,
            now,
        )
    }

    #[test]
    fn new_poll_starts_active_with_zero_counts() {
        let now = Utc::now();
        let poll = sample(now);
        assert!(poll.active);
        assert_eq!(poll.id.len(), 8);
        assert_eq!(poll.duration_ms, 60_000);
        assert_eq!(poll.expires_at(), now + Duration::minutes(1));
        assert!(poll.options.iter().all(|o| o.votes == 0));
        assert!(poll.voters.is_empty());
    }

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let now = Utc::now();
        let poll = sample(now);
        assert!(!poll.is_past_expiry(now + Duration::seconds(59)));
        assert!(poll.is_past_expiry(now + Duration::seconds(60)));
        assert_eq!(poll.time_remaining_ms(now + Duration::seconds(30)), 30_000);
        assert_eq!(poll.time_remaining_ms(now + Duration::seconds(90)), 0);
    }

    #[test]
    fn tier_parsing_and_retention() {
        assert_eq!("VIP".parse::<Tier>(), Ok(Tier::Vip));
        assert_eq!("premium".parse::<Tier>(), Ok(Tier::Premium));
        assert!("gold".parse::<Tier>().is_err());
        assert_eq!(Tier::Default.retention(), Duration::days(7));
        assert_eq!(Tier::Premium.retention(), Duration::days(14));
        assert_eq!(Tier::Vip.retention(), Duration::days(30));
    }
}
