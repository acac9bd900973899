use thiserror::Error;

// Failures at the store boundary
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("concurrent write conflict on poll {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed stored poll {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("store lock poisoned")]
    Poisoned,
}

// Everything the lifecycle manager can report back to a caller.
// The first five variants are expected, client-correctable outcomes.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("{0}")]
    Validation(String),

    #[error("poll {0} not found")]
    NotFound(String),

    #[error("this poll has ended")]
    PollEnded,

    #[error("you have already voted in this poll")]
    DuplicateVote,

    #[error("option {0} does not exist")]
    InvalidOption(i64),

    #[error("gave up after repeated write conflicts on poll {0}")]
    StoreConflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PollError {
    pub fn validation(message: impl Into<String>) -> Self {
        PollError::Validation(message.into())
    }

    // True for outcomes caused by the request rather than by the server
    pub fn is_client_error(&self) -> bool {
        !matches!(self, PollError::StoreConflict(_) | PollError::Store(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
