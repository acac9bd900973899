//! Real-time polls.
//!
//! A creator opens a poll with a question, at least two options and a voting
//! window of 1 to 60 minutes. Each client identity (IP address) may vote once,
//! and everyone watching the poll receives the new tally after every accepted
//! vote, followed by a single `pollEnded` event when the window closes.
//!
//! - [`lifecycle::PollManager`] owns every mutation of poll state.
//! - [`db::PollStore`] is the storage boundary (`MemoryStore`, `SqliteStore`).
//! - [`live::Broadcaster`] fans events out per poll.
//! - [`tasks::expiry::ExpiryScheduler`] ends polls on time; lazy checks
//!   against timestamps keep things correct if a timer is lost.
//! - [`handlers::router`] exposes it all over HTTP and WebSocket.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod live;
pub mod models;
pub mod tasks;
pub mod voting;

pub use error::{PollError, StoreError};
pub use lifecycle::PollManager;
