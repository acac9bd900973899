use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, warn};

use super::AppState;
use crate::error::PollError;
use crate::lifecycle::PollManager;
use crate::live::PollEvent;

// Unknown polls are a 404 whether or not the request is a valid upgrade
pub async fn live_updates(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(e) = state.manager.get_poll(&id).await {
        return e.into_response();
    }

    match ws {
        Ok(ws) => {
            let manager = state.manager.clone();
            ws.on_upgrade(move |socket| async move {
                let (sender, receiver) = socket.split();
                stream_poll(sender, receiver, manager, id).await;
            })
        }
        Err(rejection) => rejection.into_response(),
    }
}

async fn stream_poll<S, R, E>(mut sender: S, mut receiver: R, manager: PollManager, poll_id: String)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let mut subscription = manager.broadcaster().subscribe(&poll_id);
    debug!("Viewer joined poll {}", poll_id);

    // The poll may have ended between the upgrade request and subscribing
    let already_ended = match manager.get_poll(&poll_id).await {
        Ok(poll) => !poll.active,
        Err(PollError::NotFound(_)) => true,
        Err(e) => {
            warn!("Could not load poll {} for live viewer: {}", poll_id, e);
            true
        }
    };

    if already_ended {
        let _ = send_event(&mut sender, &PollEvent::PollEnded).await;
    } else {
        loop {
            tokio::select! {
                event = subscription.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                    if event == PollEvent::PollEnded {
                        break;
                    }
                }
                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    manager.broadcaster().unsubscribe(subscription);
    debug!("Viewer left poll {}", poll_id);
}

async fn send_event<S>(sender: &mut S, event: &PollEvent) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let text = serde_json::to_string(event).map_err(|e| {
        warn!("Failed to encode live event: {}", e);
    })?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::MemoryStore;
    use crate::lifecycle::EndTrigger;
    use crate::models::NewPoll;
    use chrono::{Duration, Utc};
    use futures::channel::mpsc;
    use serde_json::{Value, json};
    use std::sync::Arc;

    type ClientFrames = mpsc::UnboundedSender<Result<Message, axum::Error>>;

    fn manager() -> (PollManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = PollManager::with_clock(Arc::new(MemoryStore::new()), clock.clone());
        (manager, clock)
    }

    async fn open_poll(manager: &PollManager) -> String {
        manager
            .create_poll(NewPoll {
                question: "Coffee or Tea?".to_string(),
                options: vec!["Coffee".to_string(), "Tea".to_string()],
                duration_minutes: 1,
                created_by: None,
                tier: None,
            })
            .await
            .unwrap()
            .id
    }

    fn decode(frames: Vec<Message>) -> Vec<Value> {
        frames
            .into_iter()
            .map(|frame| match frame {
                Message::Text(text) => serde_json::from_str(&text).unwrap(),
                Message::Close(_) => json!("close"),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect()
    }

    async fn wait_for_subscriber(manager: &PollManager, poll_id: &str) {
        for _ in 0..1000 {
            if manager.broadcaster().subscriber_count(poll_id) == 1 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("viewer never subscribed to {poll_id}");
    }

    #[tokio::test]
    async fn joining_an_ended_poll_gets_poll_ended_then_close() {
        let (manager, clock) = manager();
        let id = open_poll(&manager).await;
        clock.advance(Duration::minutes(2));

        let (out_tx, out_rx) = mpsc::unbounded::<Message>();
        let (_client, in_rx): (ClientFrames, _) = mpsc::unbounded();
        stream_poll(out_tx, in_rx, manager.clone(), id.clone()).await;

        let frames = decode(out_rx.collect().await);
        assert_eq!(frames, vec![json!({ "type": "pollEnded" }), json!("close")]);
        assert_eq!(manager.broadcaster().subscriber_count(&id), 0);
    }

    #[tokio::test]
    async fn viewer_receives_tallies_then_a_single_poll_ended() {
        let (manager, clock) = manager();
        let id = open_poll(&manager).await;

        let (out_tx, out_rx) = mpsc::unbounded::<Message>();
        let (_client, in_rx): (ClientFrames, _) = mpsc::unbounded();
        let viewer = tokio::spawn(stream_poll(out_tx, in_rx, manager.clone(), id.clone()));
        wait_for_subscriber(&manager, &id).await;

        manager.cast_vote(&id, 1, "10.0.0.1").await.unwrap();
        manager.cast_vote(&id, 1, "10.0.0.2").await.unwrap();
        clock.advance(Duration::seconds(61));
        assert!(manager.end_poll(&id, EndTrigger::Lazy).await.unwrap());
        viewer.await.unwrap();

        let frames = decode(out_rx.collect().await);
        assert_eq!(
            frames,
            vec![
                json!({
                    "type": "voteUpdate",
                    "options": [{ "text": "Coffee", "votes": 0 }, { "text": "Tea", "votes": 1 }],
                    "totalVotes": 1
                }),
                json!({
                    "type": "voteUpdate",
                    "options": [{ "text": "Coffee", "votes": 0 }, { "text": "Tea", "votes": 2 }],
                    "totalVotes": 2
                }),
                json!({ "type": "pollEnded" }),
                json!("close"),
            ]
        );
        assert_eq!(manager.broadcaster().subscriber_count(&id), 0);
    }

    #[tokio::test]
    async fn client_close_unsubscribes_the_viewer() {
        let (manager, _clock) = manager();
        let id = open_poll(&manager).await;

        let (out_tx, out_rx) = mpsc::unbounded::<Message>();
        let (client, in_rx): (ClientFrames, _) = mpsc::unbounded();
        let viewer = tokio::spawn(stream_poll(out_tx, in_rx, manager.clone(), id.clone()));
        wait_for_subscriber(&manager, &id).await;

        client.unbounded_send(Ok(Message::Close(None))).unwrap();
        viewer.await.unwrap();

        assert_eq!(decode(out_rx.collect().await), vec![json!("close")]);
        assert_eq!(manager.broadcaster().subscriber_count(&id), 0);
    }
}
