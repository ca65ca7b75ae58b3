//! Channel registry and connection telemetry.
//!
//! The registry exclusively owns the set of channels. Callers only ever get
//! copies; latency and reliability change solely through
//! [`ChannelRegistry::record_delivery`], fed by the facade after each send.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::BridgeError;
use crate::events::{BridgeEvent, EventBus};
use crate::message::now_millis;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    /// Same-process event bus
    EventBus,
    /// Bridge across execution contexts (frames, workers, windows)
    ContextBridge,
    /// Fan-out broadcast to every listener
    Broadcast,
    Custom(String),
}

/// One transport path with its rolling health estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub kind: ChannelKind,
    pub latency_ms: f64,
    /// Rolling success ratio in [0, 1]
    pub reliability: f64,
    pub bidirectional: bool,
    pub encrypted: bool,
}

impl Channel {
    /// A bidirectional, unencrypted channel with no latency and full reliability.
    pub fn new(id: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            id: id.into(),
            kind,
            latency_ms: 0.0,
            reliability: 1.0,
            bidirectional: true,
            encrypted: false,
        }
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms.max(0.0);
        self
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability.clamp(0.0, 1.0);
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn one_way(mut self) -> Self {
        self.bidirectional = false;
        self
    }

    /// Selection score: `reliability * 100 - latency_ms`. Higher is better.
    pub fn score(&self) -> f64 {
        self.reliability * 100.0 - self.latency_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Connection-level telemetry, independent of any single channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub latency_ms: Option<f64>,
    pub last_heartbeat_at: Option<u64>,
    pub reconnect_attempts: u32,
    /// Channel the last successful heartbeat went out on.
    pub active_channel: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            latency_ms: None,
            last_heartbeat_at: None,
            reconnect_attempts: 0,
            active_channel: None,
        }
    }
}

/// Result of one send attempt, as reported back to the registry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeliveryOutcome {
    Delivered(Duration),
    Failed,
}

/// The channel chosen for a send, with the transport that serves it.
#[derive(Clone)]
pub struct SelectedChannel {
    pub channel: Channel,
    pub transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for SelectedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedChannel")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

struct ChannelEntry {
    channel: Channel,
    transport: Arc<dyn Transport>,
}

pub struct ChannelRegistry {
    /// Registration order is selection tie-break order.
    channels: RwLock<Vec<ChannelEntry>>,
    connection: RwLock<ConnectionState>,
    smoothing: f64,
    events: EventBus,
}

impl ChannelRegistry {
    /// `smoothing` is the weight given to each new latency/reliability sample.
    pub fn new(events: EventBus, smoothing: f64) -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
            connection: RwLock::new(ConnectionState::default()),
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
            events,
        }
    }

    /// Add a channel, or replace the one with the same id in place.
    ///
    /// Returns `true` when an existing channel was replaced.
    pub async fn register_channel(&self, channel: Channel, transport: Arc<dyn Transport>) -> bool {
        let channel_id = channel.id.clone();
        let replaced = {
            let mut channels = self.channels.write().await;
            match channels.iter_mut().find(|e| e.channel.id == channel.id) {
                Some(entry) => {
                    entry.channel = channel;
                    entry.transport = transport;
                    true
                }
                None => {
                    channels.push(ChannelEntry { channel, transport });
                    false
                }
            }
        };

        log::info!("Registered channel {channel_id} (replaced: {replaced})");
        self.events.publish(BridgeEvent::ChannelAdded { channel_id });
        replaced
    }

    pub async fn remove_channel(&self, channel_id: &str) -> Option<Channel> {
        let mut channels = self.channels.write().await;
        let index = channels.iter().position(|e| e.channel.id == channel_id)?;
        Some(channels.remove(index).channel)
    }

    /// Highest-scoring channel; the earliest registered wins a tie.
    pub async fn select_best_channel(&self) -> Result<SelectedChannel, BridgeError> {
        let channels = self.channels.read().await;
        let mut best: Option<&ChannelEntry> = None;
        for entry in channels.iter() {
            match best {
                Some(current) if entry.channel.score() <= current.channel.score() => {}
                _ => best = Some(entry),
            }
        }

        best.map(|entry| SelectedChannel {
            channel: entry.channel.clone(),
            transport: entry.transport.clone(),
        })
        .ok_or(BridgeError::NoChannelAvailable)
    }

    /// Fold one send outcome into the channel's rolling estimates.
    pub async fn record_delivery(&self, channel_id: &str, outcome: DeliveryOutcome) {
        let alpha = self.smoothing;
        let mut channels = self.channels.write().await;
        let Some(entry) = channels.iter_mut().find(|e| e.channel.id == channel_id) else {
            return;
        };

        let channel = &mut entry.channel;
        match outcome {
            DeliveryOutcome::Delivered(elapsed) => {
                let sample = elapsed.as_secs_f64() * 1000.0;
                channel.latency_ms = channel.latency_ms * (1.0 - alpha) + sample * alpha;
                channel.reliability = channel.reliability * (1.0 - alpha) + alpha;
            }
            DeliveryOutcome::Failed => {
                channel.reliability *= 1.0 - alpha;
            }
        }
        log::trace!(
            "Channel {channel_id}: latency {:.2}ms, reliability {:.3}",
            channel.latency_ms,
            channel.reliability
        );
    }

    /// Update connection telemetry from a heartbeat result.
    ///
    /// A connected heartbeat resets the reconnect counter; a failed one
    /// increments it. `ConnectionStateChanged` fires when the status moves.
    pub async fn record_heartbeat(
        &self,
        is_connected: bool,
        latency_ms: Option<f64>,
        channel_id: Option<&str>,
    ) {
        let changed = {
            let mut state = self.connection.write().await;
            let previous = state.status;
            if is_connected {
                state.status = ConnectionStatus::Connected;
                state.reconnect_attempts = 0;
                state.last_heartbeat_at = Some(now_millis());
                if latency_ms.is_some() {
                    state.latency_ms = latency_ms;
                }
                if let Some(id) = channel_id {
                    state.active_channel = Some(id.to_string());
                }
            } else {
                state.status = ConnectionStatus::Reconnecting;
                state.reconnect_attempts += 1;
            }
            (previous != state.status).then(|| state.clone())
        };

        if let Some(state) = changed {
            log::info!("Connection status changed to {:?}", state.status);
            self.events.publish(BridgeEvent::ConnectionStateChanged(state));
        }
    }

    /// Move a disconnected link to `Connecting`.
    pub async fn begin_connecting(&self) {
        self.set_status(ConnectionStatus::Connecting, ConnectionStatus::Disconnected)
            .await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.read().await.clone()
    }

    pub async fn channel(&self, channel_id: &str) -> Option<Channel> {
        self.channels
            .read()
            .await
            .iter()
            .find(|e| e.channel.id == channel_id)
            .map(|e| e.channel.clone())
    }

    /// Copies of all channels in registration order.
    pub async fn channels(&self) -> Vec<Channel> {
        self.channels.read().await.iter().map(|e| e.channel.clone()).collect()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Drop every channel and mark the link disconnected.
    pub async fn clear(&self) {
        self.channels.write().await.clear();
        {
            let mut state = self.connection.write().await;
            state.active_channel = None;
        }
        self.set_status(ConnectionStatus::Disconnected, ConnectionStatus::Disconnected)
            .await;
    }

    /// Set `status`. When `only_from` differs from `to`, the move happens only
    /// from that status; otherwise it happens from anywhere.
    async fn set_status(&self, to: ConnectionStatus, only_from: ConnectionStatus) {
        let changed = {
            let mut state = self.connection.write().await;
            let allowed = only_from == to || state.status == only_from;
            if allowed && state.status != to {
                state.status = to;
                Some(state.clone())
            } else {
                None
            }
        };
        if let Some(state) = changed {
            self.events.publish(BridgeEvent::ConnectionStateChanged(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessTransport;

    fn transport() -> Arc<dyn Transport> {
        Arc::new(InProcessTransport::new(8))
    }

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(EventBus::new(32), 0.5)
    }

    #[tokio::test]
    async fn test_empty_registry_has_no_channel() {
        let registry = registry();
        assert!(matches!(
            registry.select_best_channel().await,
            Err(BridgeError::NoChannelAvailable)
        ));
    }

    #[tokio::test]
    async fn test_selects_highest_score() {
        let registry = registry();
        let a = Channel::new("A", ChannelKind::EventBus).with_latency(5.0).with_reliability(0.99);
        let b = Channel::new("B", ChannelKind::Broadcast).with_latency(50.0).with_reliability(0.8);
        assert!((a.score() - 94.0).abs() < 1e-9);
        assert!((b.score() - 30.0).abs() < 1e-9);

        registry.register_channel(b, transport()).await;
        registry.register_channel(a, transport()).await;

        for _ in 0..10 {
            assert_eq!(registry.select_best_channel().await.unwrap().channel.id, "A");
        }
    }

    #[tokio::test]
    async fn test_tie_goes_to_first_registered() {
        let registry = registry();
        registry
            .register_channel(Channel::new("first", ChannelKind::EventBus).with_latency(10.0), transport())
            .await;
        registry
            .register_channel(Channel::new("second", ChannelKind::ContextBridge).with_latency(10.0), transport())
            .await;

        assert_eq!(registry.select_best_channel().await.unwrap().channel.id, "first");
    }

    #[tokio::test]
    async fn test_replace_keeps_position_and_emits() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let registry = ChannelRegistry::new(bus, 0.5);

        assert!(!registry.register_channel(Channel::new("a", ChannelKind::EventBus), transport()).await);
        assert!(!registry.register_channel(Channel::new("b", ChannelKind::EventBus), transport()).await);
        assert!(
            registry
                .register_channel(Channel::new("a", ChannelKind::Broadcast).encrypted(true), transport())
                .await
        );

        let ids: Vec<String> = registry.channels().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(registry.channel("a").await.unwrap().encrypted);

        for _ in 0..3 {
            assert!(matches!(rx.recv().await.unwrap(), BridgeEvent::ChannelAdded { .. }));
        }
    }

    #[tokio::test]
    async fn test_delivery_outcomes_roll_estimates() {
        let registry = registry();
        registry
            .register_channel(Channel::new("c", ChannelKind::EventBus).with_latency(10.0), transport())
            .await;

        registry
            .record_delivery("c", DeliveryOutcome::Delivered(Duration::from_millis(30)))
            .await;
        let channel = registry.channel("c").await.unwrap();
        assert!((channel.latency_ms - 20.0).abs() < 1e-6);
        assert!((channel.reliability - 1.0).abs() < 1e-9);

        registry.record_delivery("c", DeliveryOutcome::Failed).await;
        let channel = registry.channel("c").await.unwrap();
        assert!((channel.reliability - 0.5).abs() < 1e-9);
        assert!((channel.latency_ms - 20.0).abs() < 1e-6);

        // unknown ids are ignored
        registry.record_delivery("missing", DeliveryOutcome::Failed).await;
    }

    #[tokio::test]
    async fn test_heartbeat_resets_reconnect_attempts() {
        let registry = registry();
        registry.record_heartbeat(false, None, None).await;
        registry.record_heartbeat(false, None, None).await;

        let state = registry.connection_state().await;
        assert_eq!(state.status, ConnectionStatus::Reconnecting);
        assert_eq!(state.reconnect_attempts, 2);

        registry.record_heartbeat(true, Some(4.0), Some("bus")).await;
        let state = registry.connection_state().await;
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(state.latency_ms, Some(4.0));
        assert_eq!(state.active_channel.as_deref(), Some("bus"));
        assert!(state.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_clear_disconnects() {
        let registry = registry();
        registry.register_channel(Channel::new("a", ChannelKind::EventBus), transport()).await;
        registry.begin_connecting().await;
        assert_eq!(registry.connection_state().await.status, ConnectionStatus::Connecting);

        registry.clear().await;
        assert_eq!(registry.channel_count().await, 0);
        assert_eq!(registry.connection_state().await.status, ConnectionStatus::Disconnected);
        assert!(registry.remove_channel("a").await.is_none());
    }
}
