//! Per-poll publish/subscribe.
//!
//! Each poll id maps to a `tokio::sync::broadcast` channel. Publishing never
//! waits on subscribers: a slow subscriber that falls more than
//! `capacity` events behind loses the oldest ones. Events published on one
//! topic are received in publish order.

use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::models::{PollOption, Tally};

pub const DEFAULT_TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum PollEvent {
    #[serde(rename = "voteUpdate")]
    VoteUpdate {
        options: Vec<PollOption>,
        #[serde(rename = "totalVotes")]
        total_votes: u64,
    },
    #[serde(rename = "pollEnded")]
    PollEnded,
}

impl From<Tally> for PollEvent {
    fn from(tally: Tally) -> Self {
        PollEvent::VoteUpdate {
            options: tally.options,
            total_votes: tally.total_votes,
        }
    }
}

/// A subscriber's handle on one poll topic. Dropping it also unsubscribes,
/// [`Broadcaster::unsubscribe`] additionally prunes the topic when it empties.
#[derive(Debug)]
pub struct Subscription {
    poll_id: String,
    receiver: broadcast::Receiver<PollEvent>,
}

impl Subscription {
    pub fn poll_id(&self) -> &str {
        &self.poll_id
    }

    /// Next event, or `None` once the topic is closed. Missed events are skipped.
    pub async fn recv(&mut self) -> Option<PollEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Subscriber on poll {} skipped {} events", self.poll_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug)]
pub struct Broadcaster {
    topics: Mutex<HashMap<String, broadcast::Sender<PollEvent>>>,
    capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<PollEvent>>> {
        // The map holds no invariants a panicking holder could break
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, poll_id: &str) -> Subscription {
        let mut topics = self.topics();
        let receiver = topics
            .entry(poll_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        Subscription {
            poll_id: poll_id.to_string(),
            receiver,
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        let poll_id = subscription.poll_id.clone();
        drop(subscription);

        let mut topics = self.topics();
        if topics
            .get(&poll_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            topics.remove(&poll_id);
        }
    }

    pub fn subscriber_count(&self, poll_id: &str) -> usize {
        self.topics()
            .get(poll_id)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Push the current tally to everyone on the poll's topic.
    /// Returns how many subscribers it reached.
    pub fn publish_tally(&self, poll_id: &str, tally: Tally) -> usize {
        match self.topics().get(poll_id) {
            Some(sender) => sender.send(tally.into()).unwrap_or(0),
            None => 0,
        }
    }

    /// Terminal event. The topic is removed afterwards, so subscribers see
    /// `PollEnded` followed by the end of their stream.
    pub fn publish_ended(&self, poll_id: &str) -> usize {
        match self.topics().remove(poll_id) {
            Some(sender) => sender.send(PollEvent::PollEnded).unwrap_or(0),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(counts: &[u64]) -> Tally {
        Tally {
            options: counts
                .iter()
                .enumerate()
                .map(|(i, votes)| PollOption { text: format!("o{i}"), votes: *votes })
                .collect(),
            total_votes: counts.iter().sum(),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order_then_stream_ends() {
        let broadcaster = Broadcaster::default();
        let mut sub = broadcaster.subscribe("p1");

        assert_eq!(broadcaster.publish_tally("p1", tally(&[1, 0])), 1);
        assert_eq!(broadcaster.publish_tally("p1", tally(&[1, 1])), 1);
        assert_eq!(broadcaster.publish_ended("p1"), 1);

        assert_eq!(sub.recv().await, Some(tally(&[1, 0]).into()));
        assert_eq!(sub.recv().await, Some(tally(&[1, 1]).into()));
        assert_eq!(sub.recv().await, Some(PollEvent::PollEnded));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let broadcaster = Broadcaster::default();
        let mut a = broadcaster.subscribe("a");
        let _b = broadcaster.subscribe("b");

        broadcaster.publish_tally("b", tally(&[3]));
        broadcaster.publish_ended("a");

        assert_eq!(a.recv().await, Some(PollEvent::PollEnded));
        assert_eq!(broadcaster.subscriber_count("b"), 1);
    }

    #[test]
    fn late_subscribers_get_no_replay() {
        let broadcaster = Broadcaster::default();
        let early = broadcaster.subscribe("p");
        broadcaster.publish_tally("p", tally(&[1]));

        let mut late = broadcaster.subscribe("p");
        assert!(late.receiver.try_recv().is_err());
        drop(early);
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let broadcaster = Broadcaster::default();
        assert_eq!(broadcaster.publish_tally("ghost", tally(&[0])), 0);
        assert_eq!(broadcaster.publish_ended("ghost"), 0);
    }

    #[test]
    fn last_unsubscribe_prunes_topic() {
        let broadcaster = Broadcaster::default();
        let first = broadcaster.subscribe("p");
        let second = broadcaster.subscribe("p");
        assert_eq!(broadcaster.subscriber_count("p"), 2);

        broadcaster.unsubscribe(first);
        assert_eq!(broadcaster.subscriber_count("p"), 1);
        broadcaster.unsubscribe(second);
        assert!(broadcaster.topics().get("p").is_none());
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_to_newest() {
        let broadcaster = Broadcaster::new(2);
        let mut sub = broadcaster.subscribe("p");
        for n in 1..=5 {
            broadcaster.publish_tally("p", tally(&[n]));
        }
        assert_eq!(sub.recv().await, Some(tally(&[4]).into()));
        assert_eq!(sub.recv().await, Some(tally(&[5]).into()));
    }

    #[test]
    fn events_serialize_to_wire_shape() {
        let update = serde_json::to_value(PollEvent::from(tally(&[2, 1]))).unwrap();
        assert_eq!(update["type"], "voteUpdate");
        assert_eq!(update["totalVotes"], 3);
        assert_eq!(update["options"][0]["text"], "o0");
        assert_eq!(update["options"][0]["votes"], 2);

        let ended = serde_json::to_value(PollEvent::PollEnded).unwrap();
        assert_eq!(ended, serde_json::json!({ "type": "pollEnded" }));
    }
}
