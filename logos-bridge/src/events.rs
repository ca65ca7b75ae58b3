//! Observer events and the fan-out bus that carries them.
//!
//! Inner components only publish; the facade and any external observer
//! (dashboards, logging, tests) subscribe. Each subscriber gets an independent
//! receiver that buffers up to `capacity` events before it starts lagging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::channel::ConnectionState;
use crate::error::BridgeError;
use crate::message::Action;

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A handler completed for an inbound message.
    MessageProcessed {
        message_id: String,
        action: Action,
        result: Value,
    },
    /// Routing, handling or transmission failed; the message is in the failed set.
    MessageError {
        message_id: String,
        action: Action,
        error: BridgeError,
        attempts: u32,
    },
    /// An outbound message was confirmed by the peer (or needed no confirmation).
    MessageAcknowledged { message_id: String },
    /// The retry cap was reached; the message stays failed and is no longer swept.
    MessageAbandoned {
        message_id: String,
        action: Action,
        attempts: u32,
    },
    SyncCompleted {
        version: u64,
        timestamp: u64,
        updates_applied: usize,
    },
    ConversationSynced { conflicts_resolved: usize },
    SurfaceSynced { conflicts_resolved: usize },
    ConnectionStateChanged(ConnectionState),
    ChannelAdded { channel_id: String },
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub published: u64,
    /// Events published while nobody was subscribed.
    pub undelivered: u64,
    pub subscribers: usize,
}

struct AtomicEventStats {
    published: AtomicU64,
    undelivered: AtomicU64,
}

/// Broadcast bus for [`BridgeEvent`]s. Cloning shares the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
    capacity: usize,
    stats: Arc<AtomicEventStats>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicEventStats {
                published: AtomicU64::new(0),
                undelivered: AtomicU64::new(0),
            }),
        }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: BridgeEvent) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                self.stats.undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            published: self.stats.published.load(Ordering::Relaxed),
            undelivered: self.stats.undelivered.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let count = bus.publish(BridgeEvent::ChannelAdded { channel_id: "bus".into() });
        assert_eq!(count, 2);

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                BridgeEvent::ChannelAdded { channel_id } => assert_eq!(channel_id, "bus"),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_counted() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(BridgeEvent::SurfaceSynced { conflicts_resolved: 0 }), 0);

        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.undelivered, 1);
        assert_eq!(stats.subscribers, 0);
        assert_eq!(bus.capacity(), 4);
    }

    #[tokio::test]
    async fn test_clones_share_channel() {
        let bus = EventBus::new(8);
        let publisher = bus.clone();
        let mut rx = bus.subscribe();

        publisher.publish(BridgeEvent::MessageAcknowledged { message_id: "m".into() });
        assert!(matches!(rx.recv().await.unwrap(), BridgeEvent::MessageAcknowledged { .. }));
        assert_eq!(bus.stats().published, 1);
    }
}
