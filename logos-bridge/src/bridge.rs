//! Communication facade: one caller-owned [`Bridge`] per peer.
//!
//! ```text
//!  send_to_peer ──▸ Message ──▸ ChannelRegistry::select_best_channel
//!                                      │
//!                                      ▼
//!                   MessageRouter (outbound queue) ──▸ Transport::send
//!
//!  Transport ──▸ receive_frame ──▸ codec::decode ──▸ receive
//!                                                     │
//!                       MessageRouter::route ◂────────┤
//!                       (ack sent back if required)   │
//!                                                     ▼
//!                       StateSynchronizer::enqueue_update (state updates only)
//! ```
//!
//! [`Bridge::start`] spawns the retry sweep, the reconciliation tick and the
//! heartbeat; [`Bridge::destroy`] stops them. Without `start` nothing runs
//! in the background and the same work can be driven by hand
//! ([`Bridge::run_retry_sweep`], [`Bridge::force_sync`], [`Bridge::send_heartbeat`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::channel::{Channel, ChannelRegistry, ConnectionState, DeliveryOutcome, SelectedChannel};
use crate::codec;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::events::{BridgeEvent, EventBus};
use crate::message::{now_millis, Action, Endpoint, Message, Priority};
use crate::router::{HandlerResult, MessageHandler, MessageRouter, RetrySweep, RouteOutcome, RouterStats};
use crate::sync::{StateSynchronizer, SyncState, TickReport};
use crate::transport::Transport;

const DOMAIN_ACTIONS: [Action; 7] = [
    Action::ContentChanged,
    Action::ElementSelected,
    Action::ExecutionResult,
    Action::ErrorOccurred,
    Action::Suggestion,
    Action::Command,
    Action::ContextUpdate,
];

const UPDATE_ACTIONS: [Action; 4] = [
    Action::ConversationUpdate,
    Action::SurfaceUpdate,
    Action::UserUpdate,
    Action::SystemUpdate,
];

struct BridgeInner {
    config: BridgeConfig,
    router: MessageRouter,
    sync: Arc<StateSynchronizer>,
    registry: ChannelRegistry,
    events: EventBus,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    destroyed: AtomicBool,
}

impl BridgeInner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn abort_tasks(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }

    fn push_task(&self, task: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(poisoned) => poisoned.into_inner().push(task),
        }
    }

    async fn receive(&self, message: Message) -> RouteOutcome {
        if self.is_destroyed() {
            return RouteOutcome::Failed(BridgeError::Destroyed);
        }

        let message = Arc::new(message);
        let outcome = self.router.route(message.clone()).await;

        if let Some(ack) = outcome.ack() {
            self.dispatch(ack.clone()).await;
        }
        if message.action() == &Action::Heartbeat && outcome.is_handled() {
            self.heartbeat_received(&message).await;
        }
        if message.action().is_state_update() && !matches!(outcome, RouteOutcome::DuplicateInFlight) {
            if let Err(e) = self.sync.enqueue_update(message).await {
                log::warn!("Could not buffer state update: {e}");
            }
        }
        outcome
    }

    async fn receive_frame(&self, frame: &[u8]) -> Result<RouteOutcome, BridgeError> {
        let message = codec::decode(frame)?;
        Ok(self.receive(message).await)
    }

    /// Send a message the caller asked for. No channel means an immediate
    /// error and the message is not tracked.
    async fn send(&self, message: Message) -> Result<Arc<Message>, BridgeError> {
        if self.is_destroyed() {
            return Err(BridgeError::Destroyed);
        }
        let selected = self.registry.select_best_channel().await?;
        let message = Arc::new(message);
        self.router.track_outbound(&message).await;
        self.transmit(&message, selected).await?;
        Ok(message)
    }

    /// Send a message the bridge produced itself (acks). Failures, including
    /// a missing channel, leave it in the retry cycle.
    async fn dispatch(&self, message: Arc<Message>) {
        self.router.track_outbound(&message).await;
        match self.registry.select_best_channel().await {
            Ok(selected) => {
                if let Err(e) = self.transmit(&message, selected).await {
                    log::debug!("Dispatch of {} deferred to retry: {e}", message.id());
                }
            }
            Err(e) => {
                if self.router.begin_send(&message).await {
                    self.router.complete_send(&message, Err(e)).await;
                }
            }
        }
    }

    async fn transmit(&self, message: &Arc<Message>, selected: SelectedChannel) -> Result<(), BridgeError> {
        if !self.router.begin_send(message).await {
            return Ok(());
        }

        let frame = match codec::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                let error = BridgeError::from(e);
                self.router.complete_send(message, Err(error.clone())).await;
                return Err(error);
            }
        };

        let channel_id = selected.channel.id.clone();
        let started = Instant::now();
        match selected.transport.send(&selected.channel, frame).await {
            Ok(()) => {
                self.registry
                    .record_delivery(&channel_id, DeliveryOutcome::Delivered(started.elapsed()))
                    .await;
                log::debug!("Sent {} '{}' via {channel_id}", message.id(), message.action());
                self.router.complete_send(message, Ok(())).await;
                Ok(())
            }
            Err(e) => {
                self.registry
                    .record_delivery(&channel_id, DeliveryOutcome::Failed)
                    .await;
                let error = BridgeError::Transport(e);
                self.router.complete_send(message, Err(error.clone())).await;
                Err(error)
            }
        }
    }

    async fn retry_sweep(&self) -> RetrySweep {
        let sweep = self.router.retry_failed().await;

        for (_, outcome) in &sweep.rerouted {
            if let Some(ack) = outcome.ack() {
                self.dispatch(ack.clone()).await;
            }
        }
        for message in &sweep.retransmit {
            match self.registry.select_best_channel().await {
                Ok(selected) => {
                    if let Err(e) = self.transmit(message, selected).await {
                        log::warn!("Retransmit of {} failed: {e}", message.id());
                    }
                }
                Err(_) => log::warn!("No channel to retransmit {}", message.id()),
            }
        }
        sweep
    }

    /// Ping the best channel. The ping is not tracked for delivery; the
    /// peer echoes it and the echo carries the round trip back.
    async fn heartbeat(&self) -> Result<Arc<Message>, BridgeError> {
        let selected = match self.registry.select_best_channel().await {
            Ok(selected) => selected,
            Err(e) => {
                self.registry.record_heartbeat(false, None, None).await;
                return Err(e);
            }
        };

        let channel_id = selected.channel.id.clone();
        let message = Arc::new(Message::heartbeat_via(self.config.role, &channel_id));
        let frame = codec::encode(&message)?;

        match selected.transport.send(&selected.channel, frame).await {
            Ok(()) => {
                self.registry.record_heartbeat(true, None, Some(&channel_id)).await;
                log::trace!("Heartbeat {} sent via {channel_id}", message.id());
                Ok(message)
            }
            Err(e) => {
                self.registry
                    .record_delivery(&channel_id, DeliveryOutcome::Failed)
                    .await;
                self.registry.record_heartbeat(false, None, None).await;
                Err(BridgeError::Transport(e))
            }
        }
    }

    /// Fold an inbound heartbeat into connection telemetry.
    ///
    /// An echo of our own ping yields the round trip, credited to the
    /// channel the ping left on. A ping from the peer yields its one-way
    /// age and is echoed back.
    async fn heartbeat_received(&self, message: &Message) {
        let sent_at = message.heartbeat_sent_at().unwrap_or(message.created_at());
        let elapsed = Duration::from_millis(now_millis().saturating_sub(sent_at));
        let latency_ms = elapsed.as_secs_f64() * 1000.0;

        if message.is_heartbeat_echo() {
            let channel_id = message.heartbeat_channel();
            if let Some(id) = channel_id {
                self.registry
                    .record_delivery(id, DeliveryOutcome::Delivered(elapsed))
                    .await;
            }
            self.registry
                .record_heartbeat(true, Some(latency_ms), channel_id)
                .await;
            log::trace!("Heartbeat round trip {latency_ms:.0}ms");
            return;
        }

        self.registry.record_heartbeat(true, Some(latency_ms), None).await;
        let echo = Message::heartbeat_echo(message, self.config.role);
        match self.registry.select_best_channel().await {
            Ok(selected) => {
                let sent = match codec::encode(&echo) {
                    Ok(frame) => selected
                        .transport
                        .send(&selected.channel, frame)
                        .await
                        .map_err(BridgeError::from),
                    Err(e) => Err(BridgeError::from(e)),
                };
                if let Err(e) = sent {
                    log::debug!("Heartbeat echo not sent: {e}");
                }
            }
            Err(_) => log::debug!("No channel to echo heartbeat {}", message.id()),
        }
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// One peer's end of the bridge.
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Build a bridge with the protocol's default handlers installed.
    pub async fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let router = MessageRouter::new(events.clone(), config.max_retry_attempts)
            .with_ack_timeout(config.retry_interval());
        let sync = Arc::new(StateSynchronizer::new(events.clone()));
        let registry = ChannelRegistry::new(events.clone(), config.telemetry_smoothing);

        install_default_handlers(&router, &sync).await;
        log::info!("Bridge created for {:?}", config.role);

        Ok(Self {
            inner: Arc::new(BridgeInner {
                config,
                router,
                sync,
                registry,
                events,
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Shorthand for `Bridge::new(BridgeConfig::for_role(role))`.
    pub async fn for_role(role: Endpoint) -> Result<Self, BridgeError> {
        Self::new(BridgeConfig::for_role(role)).await
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Spawn the retry sweep, reconciliation tick and heartbeat tasks.
    ///
    /// Calling it again while running is a no-op. Must be called from within
    /// a tokio runtime.
    pub async fn start(&self) {
        if self.inner.is_destroyed() {
            return;
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.registry.begin_connecting().await;
        let config = &self.inner.config;

        let retry = spawn_periodic(&self.inner, config.retry_interval(), false, |inner| async move {
            inner.retry_sweep().await;
        });
        let tick = spawn_periodic(&self.inner, config.sync_interval(), false, |inner| async move {
            inner.sync.tick().await;
        });
        let heartbeat = spawn_periodic(&self.inner, config.heartbeat_interval(), true, |inner| async move {
            if let Err(e) = inner.heartbeat().await {
                log::warn!("Heartbeat failed: {e}");
            }
        });

        for task in [retry, tick, heartbeat] {
            self.inner.push_task(task);
        }
        log::info!("Bridge started for {:?}", config.role);
    }

    /// Stop background work, apply anything still buffered, and release all
    /// handlers and channels. Safe to call more than once.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.abort_tasks();

        if let Some(report) = self.inner.sync.force_sync().await {
            log::debug!("Final sync applied {} updates", report.updates_applied);
        }
        self.inner.router.clear_handlers().await;
        self.inner.registry.clear().await;
        log::info!("Bridge destroyed for {:?}", self.inner.config.role);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    // ---------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------

    /// Install a handler for `action`, replacing the current one.
    pub async fn register_handler(&self, action: impl Into<Action>, handler: impl MessageHandler) -> bool {
        self.inner.router.register_handler(action, handler).await
    }

    pub async fn register_channel(&self, channel: Channel, transport: Arc<dyn Transport>) -> bool {
        self.inner.registry.register_channel(channel, transport).await
    }

    pub async fn remove_channel(&self, channel_id: &str) -> Option<Channel> {
        self.inner.registry.remove_channel(channel_id).await
    }

    /// Feed every frame arriving on `frames` into [`Bridge::receive_frame`]
    /// until the sender goes away or the bridge is destroyed.
    pub fn listen(&self, mut frames: broadcast::Receiver<Arc<Vec<u8>>>) {
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                let frame = match frames.recv().await {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Listener lagged by {n} frames");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else { break };
                if inner.is_destroyed() {
                    break;
                }
                if let Err(e) = inner.receive_frame(&frame).await {
                    log::warn!("Dropping undecodable frame: {e}");
                }
            }
        });
        self.inner.push_task(task);
    }

    // ---------------------------------------------------------------
    // Send / receive
    // ---------------------------------------------------------------

    /// Send `action` to the other peer. Critical messages require an ack.
    ///
    /// Fails with `NoChannelAvailable` when no channel is registered; that
    /// message is not tracked. A transport error is returned too, but the
    /// message stays in the retry cycle.
    pub async fn send_to_peer(
        &self,
        action: impl Into<Action>,
        payload: Value,
        priority: Priority,
    ) -> Result<Arc<Message>, BridgeError> {
        let role = self.inner.config.role;
        let message = Message::new(action, payload, priority, role, role.peer());
        self.inner.send(message).await
    }

    /// Send a prebuilt message.
    pub async fn send_message(&self, message: Message) -> Result<Arc<Message>, BridgeError> {
        self.inner.send(message).await
    }

    /// Ask the peer for its sync version (critical, acknowledged).
    pub async fn request_sync(&self) -> Result<Arc<Message>, BridgeError> {
        let version = self.inner.sync.sync_version().await;
        self.send_to_peer(Action::SyncRequest, json!({ "syncVersion": version }), Priority::Critical)
            .await
    }

    /// Entry point for a message arriving from any channel.
    pub async fn receive(&self, message: Message) -> RouteOutcome {
        self.inner.receive(message).await
    }

    /// Decode a raw frame and [`receive`](Bridge::receive) it.
    pub async fn receive_frame(&self, frame: &[u8]) -> Result<RouteOutcome, BridgeError> {
        self.inner.receive_frame(frame).await
    }

    // ---------------------------------------------------------------
    // Manual drive
    // ---------------------------------------------------------------

    pub async fn run_retry_sweep(&self) -> RetrySweep {
        self.inner.retry_sweep().await
    }

    pub async fn force_sync(&self) -> Option<TickReport> {
        self.inner.sync.force_sync().await
    }

    /// Send one heartbeat now. Latency is updated when the peer's echo
    /// comes back.
    pub async fn send_heartbeat(&self) -> Result<Arc<Message>, BridgeError> {
        self.inner.heartbeat().await
    }

    // ---------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------

    pub async fn sync_state(&self) -> SyncState {
        self.inner.sync.snapshot().await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.registry.connection_state().await
    }

    pub async fn channels(&self) -> Vec<Channel> {
        self.inner.registry.channels().await
    }

    pub async fn stats(&self) -> RouterStats {
        self.inner.router.stats().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn role(&self) -> Endpoint {
        self.inner.config.role
    }
}

fn spawn_periodic<F, Fut>(inner: &Arc<BridgeInner>, period: Duration, immediate: bool, mut work: F) -> JoinHandle<()>
where
    F: FnMut(Arc<BridgeInner>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let weak: Weak<BridgeInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        let start = if immediate {
            tokio::time::Instant::now()
        } else {
            tokio::time::Instant::now() + period
        };
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            if inner.is_destroyed() {
                break;
            }
            work(inner).await;
        }
    })
}

async fn heartbeat_reply(message: Arc<Message>) -> HandlerResult {
    Ok(json!({ "latency": message.age_ms() }))
}

async fn acknowledgment_reply(message: Arc<Message>) -> HandlerResult {
    Ok(json!({ "acknowledged": message.acknowledged_id() }))
}

/// Updates are applied by the synchronizer; the handler only confirms receipt.
async fn update_received(message: Arc<Message>) -> HandlerResult {
    Ok(json!({ "buffered": message.id() }))
}

async fn domain_received(message: Arc<Message>) -> HandlerResult {
    Ok(json!({ "received": message.id() }))
}

async fn install_default_handlers(router: &MessageRouter, sync: &Arc<StateSynchronizer>) {
    router.register_handler(Action::Heartbeat, heartbeat_reply).await;
    router.register_handler(Action::Acknowledgment, acknowledgment_reply).await;

    let sync = sync.clone();
    router
        .register_handler(Action::SyncRequest, move |_message: Arc<Message>| {
            let sync = sync.clone();
            async move {
                let version = sync.sync_version().await;
                HandlerResult::Ok(json!({ "syncVersion": version }))
            }
        })
        .await;

    for action in UPDATE_ACTIONS {
        router.register_handler(action, update_received).await;
    }
    for action in DOMAIN_ACTIONS {
        router.register_handler(action, domain_received).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelKind, ConnectionStatus};
    use crate::router::DeliveryStatus;
    use crate::transport::InProcessTransport;

    #[tokio::test]
    async fn test_send_without_channel_fails_fast() {
        let bridge = Bridge::for_role(Endpoint::Producer).await.unwrap();
        let err = bridge
            .send_to_peer("echo", json!({}), Priority::Medium)
            .await
            .unwrap_err();

        assert_eq!(err, BridgeError::NoChannelAvailable);
        assert_eq!(bridge.stats().await.outbound.total(), 0);
    }

    #[tokio::test]
    async fn test_default_handlers_cover_builtin_actions() {
        let bridge = Bridge::for_role(Endpoint::Consumer).await.unwrap();
        for action in Action::BUILTIN {
            assert!(bridge.router().has_handler(&action).await, "missing {action}");
        }
    }

    #[tokio::test]
    async fn test_outbound_addressing_follows_role() {
        let bridge = Bridge::for_role(Endpoint::Consumer).await.unwrap();
        let transport = Arc::new(InProcessTransport::new(8));
        let _rx = transport.subscribe();
        bridge
            .register_channel(Channel::new("bus", ChannelKind::EventBus), transport)
            .await;

        let sent = bridge
            .send_to_peer(Action::ElementSelected, json!({"id": 3}), Priority::Low)
            .await
            .unwrap();
        assert_eq!(sent.source(), Endpoint::Consumer);
        assert_eq!(sent.target(), Endpoint::Producer);
        assert_eq!(
            bridge.router().outbound_status(sent.id()).await,
            Some(DeliveryStatus::Acknowledged)
        );
    }

    #[tokio::test]
    async fn test_transport_failure_is_retried() {
        let bridge = Bridge::for_role(Endpoint::Producer).await.unwrap();
        // no listener attached, so every send fails
        let transport = Arc::new(InProcessTransport::new(8));
        bridge
            .register_channel(Channel::new("dead", ChannelKind::EventBus), transport.clone())
            .await;

        let err = bridge
            .send_to_peer("echo", json!({}), Priority::High)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(bridge.stats().await.outbound.failed, 1);

        let _rx = transport.subscribe();
        let sweep = bridge.run_retry_sweep().await;
        assert_eq!(sweep.retransmit.len(), 1);
        assert_eq!(bridge.stats().await.outbound.acknowledged, 1);
        assert!(bridge.channels().await[0].reliability < 1.0);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_connection_state() {
        let bridge = Bridge::for_role(Endpoint::Producer).await.unwrap();
        assert!(bridge.send_heartbeat().await.is_err());
        assert_eq!(bridge.connection_state().await.reconnect_attempts, 1);

        let transport = Arc::new(InProcessTransport::new(8));
        let _rx = transport.subscribe();
        bridge
            .register_channel(Channel::new("bus", ChannelKind::EventBus), transport)
            .await;
        bridge.send_heartbeat().await.unwrap();

        let state = bridge.connection_state().await;
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(state.active_channel.as_deref(), Some("bus"));
    }

    #[tokio::test]
    async fn test_inbound_heartbeat_is_timed_and_echoed() {
        let bridge = Bridge::for_role(Endpoint::Producer).await.unwrap();
        let transport = Arc::new(InProcessTransport::new(8));
        let mut frames = transport.subscribe();
        bridge
            .register_channel(Channel::new("bus", ChannelKind::EventBus), transport)
            .await;

        let ping = Message::heartbeat_via(Endpoint::Consumer, "c2p");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(bridge.receive(ping.clone()).await.is_handled());

        let state = bridge.connection_state().await;
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert!(state.latency_ms.unwrap() >= 39.0);
        assert!(state.last_heartbeat_at.is_some());

        let mut echo = None;
        while let Ok(frame) = frames.try_recv() {
            let message = codec::decode(&frame).unwrap();
            if message.is_heartbeat_echo() {
                echo = Some(message);
            }
        }
        let echo = echo.expect("no echo sent");
        assert_eq!(echo.heartbeat_sent_at(), ping.heartbeat_sent_at());
        assert_eq!(echo.heartbeat_channel(), Some("c2p"));
        assert_eq!(echo.target(), Endpoint::Consumer);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let bridge = Bridge::for_role(Endpoint::Producer).await.unwrap();
        let transport = Arc::new(InProcessTransport::new(8));
        bridge
            .register_channel(Channel::new("bus", ChannelKind::EventBus), transport)
            .await;
        bridge.start().await;

        bridge.destroy().await;
        bridge.destroy().await;

        assert!(bridge.is_destroyed());
        assert!(bridge.channels().await.is_empty());
        assert_eq!(bridge.stats().await.handlers, 0);
        assert_eq!(
            bridge.send_to_peer("echo", json!({}), Priority::Low).await.unwrap_err(),
            BridgeError::Destroyed
        );
        let late = Message::new("echo", json!({}), Priority::Low, Endpoint::Consumer, Endpoint::Producer);
        assert!(matches!(
            bridge.receive(late).await,
            RouteOutcome::Failed(BridgeError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_destroy_drains_pending_updates() {
        let bridge = Bridge::for_role(Endpoint::Consumer).await.unwrap();
        let update = Message::new(
            Action::ConversationUpdate,
            json!({"topic": "layout"}),
            Priority::Medium,
            Endpoint::Producer,
            Endpoint::Consumer,
        );
        bridge.receive(update).await;
        assert_eq!(bridge.sync_state().await.pending_updates.len(), 1);

        bridge.destroy().await;
        let state = bridge.sync_state().await;
        assert_eq!(state.conversation_context["topic"], json!("layout"));
        assert_eq!(state.sync_version, 1);
    }
}
