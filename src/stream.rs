//! Long-lived push transport for run and session event channels.
//!
//! Each connection immediately receives a `connected` acknowledgement,
//! then one SSE message per channel event. The stream ends when the
//! channel delivers a terminal event, when the channel is torn down, or
//! when the client disconnects. As a redundant liveness path the
//! persisted status is polled every two seconds and the stream closes
//! once that status is terminal, covering event loss.

use std::str::FromStr;
use std::time::Duration;

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use tracing::debug;

use crate::db::DbHandle;
use crate::events::EventHub;
use crate::models::{RunStatus, SessionStatus};

/// Which table backs the redundant status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Run,
    Session,
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Self::Run),
            "session" => Ok(Self::Session),
            _ => Err(format!("Invalid channel kind: {}", s)),
        }
    }
}

/// How often the persisted status is re-checked.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// True when the persisted record is terminal or gone.
async fn status_is_terminal(db: &DbHandle, kind: ChannelKind, id: &str) -> bool {
    let id = id.to_string();
    let result = match kind {
        ChannelKind::Run => {
            db.call(move |db| Ok(db.get_run(&id)?.map(|r| r.status.is_terminal())))
                .await
        }
        ChannelKind::Session => {
            db.call(move |db| Ok(db.get_session(&id)?.map(|s| s.status.is_terminal())))
                .await
        }
    };
    match result {
        Ok(Some(terminal)) => terminal,
        // Deleted records close the stream; transient DB errors do not.
        Ok(None) => true,
        Err(_) => false,
    }
}

/// The raw event stream behind the SSE response.
pub fn channel_stream(
    db: DbHandle,
    hub: EventHub,
    kind: ChannelKind,
    channel_id: String,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream! {
        let mut rx = hub.subscribe(&channel_id);

        match Event::default()
            .event("connected")
            .json_data(serde_json::json!({"channel": &channel_id}))
        {
            Ok(ack) => yield Ok(ack),
            Err(e) => {
                yield Err(e);
                return;
            }
        }

        let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);
        // The first tick fires immediately; consume it so the first real
        // poll happens after the interval.
        poll.tick().await;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            let terminal = event.kind.is_terminal();
                            let name = event.kind.as_str().to_string();
                            match Event::default().event(name).json_data(&event) {
                                Ok(sse_event) => yield Ok(sse_event),
                                Err(e) => {
                                    yield Err(e);
                                    break;
                                }
                            }
                            if terminal {
                                break;
                            }
                        }
                        // Channel removed from the registry.
                        None => break,
                    }
                }
                _ = poll.tick() => {
                    if status_is_terminal(&db, kind, &channel_id).await {
                        debug!(channel = %channel_id, "closing stream on terminal polled status");
                        break;
                    }
                }
            }
        }
    }
}

/// Wrap the channel stream as an SSE response with keepalives.
pub fn channel_sse(
    db: DbHandle,
    hub: EventHub,
    kind: ChannelKind,
    channel_id: String,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    Sse::new(channel_stream(db, hub, kind, channel_id)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::VigilDb;
    use crate::models::{Run, StreamEventType, now_ts};
    use futures_util::StreamExt;

    fn handle() -> DbHandle {
        DbHandle::new(VigilDb::new_in_memory().unwrap())
    }

    fn insert_run(db: &DbHandle, id: &str) {
        let guard = db.lock_sync().unwrap();
        guard
            .insert_run(&Run {
                id: id.into(),
                user_id: "u1".into(),
                tool: "nmap".into(),
                scope_id: None,
                target: "10.0.0.5".into(),
                params: serde_json::json!({}),
                status: RunStatus::Pending,
                exit_code: None,
                error: None,
                timeout_secs: 300,
                created_at: now_ts(),
                started_at: None,
                completed_at: None,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn ack_comes_first_then_events() {
        let db = handle();
        insert_run(&db, "r1");
        let hub = EventHub::new();
        hub.emit("r1", StreamEventType::Output, serde_json::json!({"chunk": "early"}));

        let stream = channel_stream(db, hub.clone(), ChannelKind::Run, "r1".into());
        futures::pin_mut!(stream);

        let ack = stream.next().await.unwrap().unwrap();
        let ack_text = format!("{:?}", ack);
        assert!(ack_text.contains("connected"));

        // The buffered event published before we connected is replayed.
        let replayed = stream.next().await.unwrap().unwrap();
        assert!(format!("{:?}", replayed).contains("early"));
    }

    #[tokio::test]
    async fn stream_ends_on_terminal_event() {
        let db = handle();
        insert_run(&db, "r1");
        let hub = EventHub::new();

        let stream = channel_stream(db, hub.clone(), ChannelKind::Run, "r1".into());
        futures::pin_mut!(stream);
        let _ack = stream.next().await.unwrap().unwrap();

        hub.emit("r1", StreamEventType::Completed, serde_json::json!({"exit_code": 0}));
        let terminal = stream.next().await.unwrap().unwrap();
        assert!(format!("{:?}", terminal).contains("completed"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn status_poll_closes_stream_without_events() {
        let db = handle();
        insert_run(&db, "r1");
        {
            let guard = db.lock_sync().unwrap();
            guard
                .transition_run("r1", RunStatus::Failed, Some("died quietly"), None)
                .unwrap();
        }
        let hub = EventHub::new();

        // No events ever arrive; the 2s status poll must end the stream.
        let stream = channel_stream(db, hub, ChannelKind::Run, "r1".into());
        futures::pin_mut!(stream);
        let _ack = stream.next().await.unwrap().unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), stream.next()).await;
        assert!(matches!(next, Ok(None)));
    }

    #[tokio::test]
    async fn missing_record_counts_as_terminal() {
        let db = handle();
        assert!(status_is_terminal(&db, ChannelKind::Run, "ghost").await);
        assert!(status_is_terminal(&db, ChannelKind::Session, "ghost").await);
    }

    #[test]
    fn channel_kind_parses() {
        assert_eq!("run".parse::<ChannelKind>().unwrap(), ChannelKind::Run);
        assert_eq!(
            "session".parse::<ChannelKind>().unwrap(),
            ChannelKind::Session
        );
        assert!("other".parse::<ChannelKind>().is_err());
    }
}
