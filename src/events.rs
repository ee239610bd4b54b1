//! Per-channel event distribution with bounded replay.
//!
//! Channels are created lazily per run or session id. Each holds the most
//! recent [`REPLAY_CAPACITY`] events; a new subscriber receives that
//! backlog oldest-to-newest before any live events, so a late joiner can
//! catch up without unbounded history. Delivery order is strict per
//! channel; cross-channel ordering is unspecified. On a terminal event the
//! channel is marked closed and removed from the registry after a grace
//! window so slow subscribers can drain.
//!
//! Every event is also mirrored onto a process-wide broadcast feed
//! consumed by the WebSocket handler.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::models::{StreamEvent, StreamEventType};

/// Most recent events retained per channel for late-joiner replay.
pub const REPLAY_CAPACITY: usize = 100;

/// How long a closed channel lingers so slow subscribers can drain.
pub const CLOSE_GRACE: Duration = Duration::from_secs(60);

struct Channel {
    buffer: VecDeque<StreamEvent>,
    subscribers: Vec<mpsc::UnboundedSender<StreamEvent>>,
    closed: bool,
}

impl Channel {
    fn new() -> Self {
        Self {
            buffer: VecDeque::with_capacity(REPLAY_CAPACITY),
            subscribers: Vec::new(),
            closed: false,
        }
    }
}

/// Registry of per-id replay channels plus the global mirror feed.
#[derive(Clone)]
pub struct EventHub {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
    mirror: broadcast::Sender<String>,
    grace: Duration,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_grace(CLOSE_GRACE)
    }

    /// Construct with a custom close-grace window (tests use a short one).
    pub fn with_grace(grace: Duration) -> Self {
        let (mirror, _) = broadcast::channel(256);
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            mirror,
            grace,
        }
    }

    /// Publish an event to a channel, creating the channel on first use.
    /// Terminal events close the channel and schedule its removal.
    pub fn publish(&self, event: StreamEvent) {
        let terminal = event.kind.is_terminal();
        let channel_id = event.channel.clone();

        {
            let mut channels = match self.channels.lock() {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("event hub lock poisoned: {}", e);
                    return;
                }
            };
            let channel = channels
                .entry(channel_id.clone())
                .or_insert_with(Channel::new);
            if channel.closed {
                // Publishers are expected to stop at the terminal event;
                // anything after it is dropped.
                return;
            }

            if channel.buffer.len() == REPLAY_CAPACITY {
                channel.buffer.pop_front();
            }
            channel.buffer.push_back(event.clone());
            channel
                .subscribers
                .retain(|sender| sender.send(event.clone()).is_ok());

            if terminal {
                channel.closed = true;
            }
        }

        if let Ok(json) = serde_json::to_string(&event) {
            let _ = self.mirror.send(json);
        }

        if terminal {
            let channels = Arc::clone(&self.channels);
            let grace = self.grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Ok(mut channels) = channels.lock() {
                    // Dropping the entry drops every subscriber sender,
                    // which ends the subscriber streams.
                    channels.remove(&channel_id);
                }
            });
        }
    }

    /// Convenience: build and publish an event in one call.
    pub fn emit(&self, channel: &str, kind: StreamEventType, payload: serde_json::Value) {
        self.publish(StreamEvent::new(channel.to_string(), kind, payload));
    }

    /// Subscribe to a channel. The receiver first yields the buffered
    /// backlog oldest-to-newest, then live events until the channel is
    /// removed from the registry.
    pub fn subscribe(&self, channel_id: &str) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!("event hub lock poisoned: {}", e);
                return rx;
            }
        };
        let channel = channels
            .entry(channel_id.to_string())
            .or_insert_with(Channel::new);
        for event in &channel.buffer {
            let _ = tx.send(event.clone());
        }
        channel.subscribers.push(tx);
        rx
    }

    /// Subscribe to the process-wide mirror of every published event.
    pub fn subscribe_mirror(&self) -> broadcast::Receiver<String> {
        self.mirror.subscribe()
    }

    /// Whether a channel currently exists in the registry.
    pub fn has_channel(&self, channel_id: &str) -> bool {
        self.channels
            .lock()
            .map(|channels| channels.contains_key(channel_id))
            .unwrap_or(false)
    }

    /// Whether a channel exists and has been closed by a terminal event.
    pub fn is_closed(&self, channel_id: &str) -> bool {
        self.channels
            .lock()
            .map(|channels| {
                channels
                    .get(channel_id)
                    .map(|c| c.closed)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_event(channel: &str, n: usize) -> StreamEvent {
        StreamEvent::new(
            channel,
            StreamEventType::Output,
            serde_json::json!({"seq": n}),
        )
    }

    #[tokio::test]
    async fn late_subscriber_replays_last_100_in_order() {
        let hub = EventHub::new();
        for n in 0..150 {
            hub.publish(output_event("run-1", n));
        }

        let mut rx = hub.subscribe("run-1");
        hub.emit("run-1", StreamEventType::Progress, serde_json::json!({}));

        let mut seqs = Vec::new();
        for _ in 0..REPLAY_CAPACITY {
            let ev = rx.recv().await.unwrap();
            seqs.push(ev.payload["seq"].as_u64().unwrap());
        }
        // Exactly the last 100, in original order.
        assert_eq!(seqs.first(), Some(&50));
        assert_eq!(seqs.last(), Some(&149));
        assert!(seqs.windows(2).all(|w| w[0] + 1 == w[1]));

        // Then the live event published after subscribing.
        let live = rx.recv().await.unwrap();
        assert_eq!(live.kind, StreamEventType::Progress);
    }

    #[tokio::test]
    async fn early_subscriber_sees_everything_live() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe("run-1");
        for n in 0..5 {
            hub.publish(output_event("run-1", n));
        }
        for n in 0..5 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.payload["seq"], n);
        }
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let hub = EventHub::new();
        let mut rx_a = hub.subscribe("run-a");
        let _rx_b = hub.subscribe("run-b");

        hub.publish(output_event("run-b", 1));
        hub.publish(output_event("run-a", 7));

        let ev = rx_a.recv().await.unwrap();
        assert_eq!(ev.channel, "run-a");
        assert_eq!(ev.payload["seq"], 7);
    }

    #[tokio::test]
    async fn terminal_event_closes_and_removes_after_grace() {
        let hub = EventHub::with_grace(Duration::from_millis(20));
        let mut rx = hub.subscribe("run-1");
        hub.emit("run-1", StreamEventType::Completed, serde_json::json!({}));

        assert!(hub.is_closed("run-1"));
        // The terminal event is still delivered to subscribers.
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, StreamEventType::Completed);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!hub.has_channel("run-1"));
        // Removal dropped the sender; the subscriber stream ends.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn publishes_after_terminal_are_dropped() {
        let hub = EventHub::with_grace(Duration::from_secs(60));
        hub.emit("run-1", StreamEventType::Failed, serde_json::json!({}));
        hub.emit("run-1", StreamEventType::Output, serde_json::json!({"seq": 1}));

        let mut rx = hub.subscribe("run-1");
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, StreamEventType::Failed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn mirror_carries_all_channels() {
        let hub = EventHub::new();
        let mut mirror = hub.subscribe_mirror();
        hub.publish(output_event("run-1", 1));
        hub.publish(output_event("run-2", 2));

        let first = mirror.recv().await.unwrap();
        assert!(first.contains("\"channel\":\"run-1\""));
        let second = mirror.recv().await.unwrap();
        assert!(second.contains("\"channel\":\"run-2\""));
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_next_publish() {
        let hub = EventHub::new();
        let rx = hub.subscribe("run-1");
        drop(rx);
        // Publish twice; the first prunes the dead sender, neither panics.
        hub.publish(output_event("run-1", 1));
        hub.publish(output_event("run-1", 2));

        let mut rx = hub.subscribe("run-1");
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.payload["seq"], 1);
    }
}
