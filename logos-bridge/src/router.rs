//! Action dispatch, delivery tracking and retry.
//!
//! ```text
//!            route()                      success
//!  Pending ──────────▸ Processing ──────────────────▸ Acknowledged
//!                        ▲    │
//!          retry sweep   │    │ handler error / no handler / transport error
//!                        │    ▼
//!                        └── Failed
//! ```
//!
//! Every tracked id sits in exactly one state. Inbound messages (handed to
//! handlers) and outbound messages (sent by this peer) live in separate
//! queues, so a loopback peer can see its own id in both without tripping
//! the single-flight check.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::error::{BridgeError, HandlerError};
use crate::events::{BridgeEvent, EventBus};
use crate::message::{Action, Message};

pub type HandlerResult = Result<Value, HandlerError>;

/// How long a delivered message may wait for its ack before it is sent again.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Handles every inbound message for one action.
///
/// Implemented for any `Fn(Arc<Message>) -> impl Future<Output = HandlerResult>`,
/// so async closures register directly.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(message))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Failed,
    Acknowledged,
}

/// Number of ids in each delivery state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
    pub acknowledged: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.failed + self.acknowledged
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub inbound: QueueCounts,
    pub outbound: QueueCounts,
    pub handlers: usize,
}

struct DeliveryEntry {
    /// Released once the entry is acknowledged.
    message: Option<Arc<Message>>,
    status: DeliveryStatus,
    attempts: u32,
    seq: u64,
    abandoned: bool,
    awaiting_ack_since: Option<Instant>,
}

/// Delivery state for every message id seen in one direction.
#[derive(Default)]
pub struct DeliveryQueue {
    entries: HashMap<String, DeliveryEntry>,
    next_seq: u64,
}

impl DeliveryQueue {
    pub fn status_of(&self, id: &str) -> Option<DeliveryStatus> {
        self.entries.get(id).map(|e| e.status)
    }

    /// Processing attempts made so far (initial dispatch plus retries).
    pub fn attempts(&self, id: &str) -> u32 {
        self.entries.get(id).map_or(0, |e| e.attempts)
    }

    /// Ids in `status`, in first-seen order.
    pub fn ids_with(&self, status: DeliveryStatus) -> Vec<String> {
        let mut matching: Vec<(&String, &DeliveryEntry)> =
            self.entries.iter().filter(|(_, e)| e.status == status).collect();
        matching.sort_by_key(|(_, e)| e.seq);
        matching.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for entry in self.entries.values() {
            match entry.status {
                DeliveryStatus::Pending => counts.pending += 1,
                DeliveryStatus::Processing => counts.processing += 1,
                DeliveryStatus::Failed => counts.failed += 1,
                DeliveryStatus::Acknowledged => counts.acknowledged += 1,
            }
        }
        counts
    }

    fn insert_pending(&mut self, message: &Arc<Message>) {
        if self.entries.contains_key(message.id()) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            message.id().to_string(),
            DeliveryEntry {
                message: Some(message.clone()),
                status: DeliveryStatus::Pending,
                attempts: 0,
                seq,
                abandoned: false,
                awaiting_ack_since: None,
            },
        );
    }

    /// Move to `Processing` unless already there. Returns the attempt number.
    fn begin(&mut self, message: &Arc<Message>) -> Option<u32> {
        self.insert_pending(message);
        let entry = self.entries.get_mut(message.id())?;
        if entry.status == DeliveryStatus::Processing {
            return None;
        }
        entry.status = DeliveryStatus::Processing;
        entry.attempts += 1;
        entry.awaiting_ack_since = None;
        if entry.message.is_none() {
            entry.message = Some(message.clone());
        }
        Some(entry.attempts)
    }

    fn settle(&mut self, id: &str, status: DeliveryStatus) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.status = status;
            entry.awaiting_ack_since = None;
            if status == DeliveryStatus::Acknowledged {
                entry.message = None;
            }
        }
    }

    /// Start the ack clock for a delivered message.
    fn await_ack(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.awaiting_ack_since = Some(Instant::now());
        }
    }

    /// Move messages that waited longer than `timeout` for an ack to `Failed`.
    fn expire_unacked(&mut self, timeout: Duration) -> Vec<(Arc<Message>, u32)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in self.entries.values_mut() {
            let overdue = entry.status == DeliveryStatus::Processing
                && entry
                    .awaiting_ack_since
                    .is_some_and(|since| now.duration_since(since) >= timeout);
            if !overdue {
                continue;
            }
            entry.status = DeliveryStatus::Failed;
            entry.awaiting_ack_since = None;
            if let Some(message) = &entry.message {
                expired.push((message.clone(), entry.attempts));
            }
        }
        expired
    }

    /// Failed messages still eligible for retry, oldest first, plus the ones
    /// that just crossed `max_retries` (marked abandoned and left failed).
    fn take_retryable(&mut self, max_retries: Option<u32>) -> (Vec<Arc<Message>>, Vec<(Arc<Message>, u32)>) {
        let mut failed: Vec<&mut DeliveryEntry> = self
            .entries
            .values_mut()
            .filter(|e| e.status == DeliveryStatus::Failed && !e.abandoned)
            .collect();
        failed.sort_by_key(|e| e.seq);

        let mut retry = Vec::new();
        let mut abandoned = Vec::new();
        for entry in failed {
            let Some(message) = entry.message.clone() else { continue };
            let retries_done = entry.attempts.saturating_sub(1);
            match max_retries {
                Some(max) if retries_done >= max => {
                    entry.abandoned = true;
                    abandoned.push((message, entry.attempts));
                }
                _ => retry.push(message),
            }
        }
        (retry, abandoned)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Result of routing one inbound message.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    /// The handler succeeded. `ack` is set when the sender asked for one and
    /// must be transmitted back.
    Handled {
        result: Value,
        ack: Option<Arc<Message>>,
    },
    /// Same id already in `Processing`; nothing was done.
    DuplicateInFlight,
    /// Recorded as failed and reported via `MessageError`; will be retried.
    Failed(BridgeError),
}

impl RouteOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, RouteOutcome::Handled { .. })
    }

    pub fn ack(&self) -> Option<&Arc<Message>> {
        match self {
            RouteOutcome::Handled { ack, .. } => ack.as_ref(),
            _ => None,
        }
    }
}

/// What one retry sweep did.
#[derive(Debug, Default)]
pub struct RetrySweep {
    /// Inbound messages routed again, with their outcome.
    pub rerouted: Vec<(Arc<Message>, RouteOutcome)>,
    /// Outbound messages the caller must transmit again.
    pub retransmit: Vec<Arc<Message>>,
    pub abandoned: usize,
}

pub struct MessageRouter {
    handlers: RwLock<HashMap<Action, Arc<dyn MessageHandler>>>,
    inbound: Mutex<DeliveryQueue>,
    outbound: Mutex<DeliveryQueue>,
    events: EventBus,
    max_retry_attempts: Option<u32>,
    ack_timeout: Duration,
}

impl MessageRouter {
    /// `max_retry_attempts` of `None` keeps failed messages in the retry cycle forever.
    pub fn new(events: EventBus, max_retry_attempts: Option<u32>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            inbound: Mutex::new(DeliveryQueue::default()),
            outbound: Mutex::new(DeliveryQueue::default()),
            events,
            max_retry_attempts,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// Resend a delivered message whose ack has not arrived after `timeout`.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    // ---------------------------------------------------------------
    // Handler table
    // ---------------------------------------------------------------

    /// Install `handler` for `action`, replacing any previous one.
    ///
    /// Returns `true` if a handler was replaced.
    pub async fn register_handler(&self, action: impl Into<Action>, handler: impl MessageHandler) -> bool {
        let action = action.into();
        log::debug!("Registering handler for '{action}'");
        self.handlers
            .write()
            .await
            .insert(action, Arc::new(handler))
            .is_some()
    }

    pub async fn unregister_handler(&self, action: &Action) -> bool {
        self.handlers.write().await.remove(action).is_some()
    }

    pub async fn has_handler(&self, action: &Action) -> bool {
        self.handlers.read().await.contains_key(action)
    }

    pub async fn clear_handlers(&self) {
        self.handlers.write().await.clear();
    }

    // ---------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------

    /// Dispatch an inbound message to its handler.
    ///
    /// Failures are recorded and published, never returned as `Err`; the
    /// outcome only tells the caller what happened.
    pub async fn route(&self, message: Arc<Message>) -> RouteOutcome {
        let attempts = match self.inbound.lock().await.begin(&message) {
            Some(attempts) => attempts,
            None => {
                log::debug!("Message {} already in flight, skipping", message.id());
                return RouteOutcome::DuplicateInFlight;
            }
        };

        let handler = self.handlers.read().await.get(message.action()).cloned();
        let result = match handler {
            None => Err(BridgeError::NoHandler(message.action().clone())),
            Some(handler) => match AssertUnwindSafe(handler.handle(message.clone()))
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(BridgeError::HandlerExecution {
                    action: message.action().clone(),
                    reason: e.0,
                }),
                Err(_) => Err(BridgeError::HandlerExecution {
                    action: message.action().clone(),
                    reason: "handler panicked".into(),
                }),
            },
        };

        match result {
            Ok(value) => {
                self.inbound
                    .lock()
                    .await
                    .settle(message.id(), DeliveryStatus::Acknowledged);
                if let Some(original) = message.acknowledged_id() {
                    self.settle_ack(original).await;
                }
                log::debug!("Routed {} '{}' (attempt {attempts})", message.id(), message.action());

                let ack = message
                    .requires_ack()
                    .then(|| Arc::new(Message::acknowledgment(&message)));
                self.events.publish(BridgeEvent::MessageProcessed {
                    message_id: message.id().to_string(),
                    action: message.action().clone(),
                    result: value.clone(),
                });
                RouteOutcome::Handled { result: value, ack }
            }
            Err(error) => {
                self.inbound
                    .lock()
                    .await
                    .settle(message.id(), DeliveryStatus::Failed);
                log::warn!("Message {} failed (attempt {attempts}): {error}", message.id());
                self.events.publish(BridgeEvent::MessageError {
                    message_id: message.id().to_string(),
                    action: message.action().clone(),
                    error: error.clone(),
                    attempts,
                });
                RouteOutcome::Failed(error)
            }
        }
    }

    // ---------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------

    /// Start tracking an outbound message as `Pending`.
    pub async fn track_outbound(&self, message: &Arc<Message>) {
        self.outbound.lock().await.insert_pending(message);
    }

    /// Mark an outbound message as dispatched. `false` if a send is already in flight.
    pub async fn begin_send(&self, message: &Arc<Message>) -> bool {
        self.outbound.lock().await.begin(message).is_some()
    }

    /// Record the result of transmitting an outbound message.
    ///
    /// A delivered message that expects an ack stays `Processing` until the
    /// ack arrives; anything else is acknowledged right away.
    pub async fn complete_send(&self, message: &Message, result: Result<(), BridgeError>) {
        let mut outbound = self.outbound.lock().await;
        match result {
            Ok(()) if message.requires_ack() => outbound.await_ack(message.id()),
            Ok(()) => {
                outbound.settle(message.id(), DeliveryStatus::Acknowledged);
                drop(outbound);
                self.events.publish(BridgeEvent::MessageAcknowledged {
                    message_id: message.id().to_string(),
                });
            }
            Err(error) => {
                if outbound.status_of(message.id()) != Some(DeliveryStatus::Processing) {
                    return;
                }
                outbound.settle(message.id(), DeliveryStatus::Failed);
                let attempts = outbound.attempts(message.id());
                drop(outbound);
                log::warn!("Send of {} failed (attempt {attempts}): {error}", message.id());
                self.events.publish(BridgeEvent::MessageError {
                    message_id: message.id().to_string(),
                    action: message.action().clone(),
                    error,
                    attempts,
                });
            }
        }
    }

    /// Mark the outbound message `original_id` acknowledged by the peer.
    pub async fn settle_ack(&self, original_id: &str) -> bool {
        {
            let mut outbound = self.outbound.lock().await;
            match outbound.status_of(original_id) {
                None | Some(DeliveryStatus::Acknowledged) => return false,
                Some(_) => outbound.settle(original_id, DeliveryStatus::Acknowledged),
            }
        }
        self.events.publish(BridgeEvent::MessageAcknowledged {
            message_id: original_id.to_string(),
        });
        true
    }

    // ---------------------------------------------------------------
    // Retry
    // ---------------------------------------------------------------

    /// Re-route every failed inbound message and hand back failed outbound
    /// ones for retransmission. Delivered messages still missing their ack
    /// after the ack timeout count as failed. A message that fails again
    /// stays failed for the next sweep.
    pub async fn retry_failed(&self) -> RetrySweep {
        let (inbound, mut abandoned) = self.inbound.lock().await.take_retryable(self.max_retry_attempts);
        let (expired, retransmit, abandoned_out) = {
            let mut outbound = self.outbound.lock().await;
            let expired = outbound.expire_unacked(self.ack_timeout);
            let (retransmit, abandoned_out) = outbound.take_retryable(self.max_retry_attempts);
            (expired, retransmit, abandoned_out)
        };
        abandoned.extend(abandoned_out);

        for (message, attempts) in expired {
            log::warn!("No ack for {} after attempt {attempts}, resending", message.id());
            self.events.publish(BridgeEvent::MessageError {
                message_id: message.id().to_string(),
                action: message.action().clone(),
                error: BridgeError::AckTimeout(message.id().to_string()),
                attempts,
            });
        }

        for (message, attempts) in &abandoned {
            log::warn!("Abandoning {} after {attempts} attempts", message.id());
            self.events.publish(BridgeEvent::MessageAbandoned {
                message_id: message.id().to_string(),
                action: message.action().clone(),
                attempts: *attempts,
            });
        }

        if !inbound.is_empty() || !retransmit.is_empty() {
            log::debug!(
                "Retry sweep: {} to re-route, {} to retransmit",
                inbound.len(),
                retransmit.len()
            );
        }

        let mut rerouted = Vec::with_capacity(inbound.len());
        for message in inbound {
            let outcome = self.route(message.clone()).await;
            rerouted.push((message, outcome));
        }

        RetrySweep {
            rerouted,
            retransmit,
            abandoned: abandoned.len(),
        }
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    pub async fn inbound_status(&self, id: &str) -> Option<DeliveryStatus> {
        self.inbound.lock().await.status_of(id)
    }

    pub async fn outbound_status(&self, id: &str) -> Option<DeliveryStatus> {
        self.outbound.lock().await.status_of(id)
    }

    pub async fn inbound_attempts(&self, id: &str) -> u32 {
        self.inbound.lock().await.attempts(id)
    }

    pub async fn inbound_ids(&self, status: DeliveryStatus) -> Vec<String> {
        self.inbound.lock().await.ids_with(status)
    }

    pub async fn outbound_ids(&self, status: DeliveryStatus) -> Vec<String> {
        self.outbound.lock().await.ids_with(status)
    }

    pub async fn stats(&self) -> RouterStats {
        RouterStats {
            inbound: self.inbound.lock().await.counts(),
            outbound: self.outbound.lock().await.counts(),
            handlers: self.handlers.read().await.len(),
        }
    }

    /// Forget all tracked deliveries.
    pub async fn clear_queues(&self) {
        self.inbound.lock().await.clear();
        self.outbound.lock().await.clear();
    }
}
