//! Message model shared by every bridge component.
//!
//! A [`Message`] is built once and then only read: fields are private and the
//! router shares it as `Arc<Message>`, so a retry re-sends the very same value
//! and idempotent handlers can deduplicate by [`Message::id`].

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Party a message originates from or is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Endpoint {
    /// The assistant side.
    Producer,
    /// The canvas / document surface side.
    Consumer,
    System,
    Both,
}

impl Endpoint {
    /// The opposite peer. `System` and `Both` have no single peer and map to `Both`.
    pub fn peer(self) -> Endpoint {
        match self {
            Endpoint::Producer => Endpoint::Consumer,
            Endpoint::Consumer => Endpoint::Producer,
            Endpoint::System | Endpoint::Both => Endpoint::Both,
        }
    }
}

/// Direction of a message, derived from its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    ProducerToConsumer,
    ConsumerToProducer,
    Bidirectional,
}

impl MessageKind {
    fn between(source: Endpoint, target: Endpoint) -> Self {
        match (source, target) {
            (Endpoint::Producer, Endpoint::Consumer) => MessageKind::ProducerToConsumer,
            (Endpoint::Consumer, Endpoint::Producer) => MessageKind::ConsumerToProducer,
            _ => MessageKind::Bidirectional,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Semantic operation carried by a message.
///
/// Protocol and domain actions are closed variants; anything else is
/// `Custom`. Build from strings with `Action::from`, which normalizes known
/// names (including the `canvas-update` alias) so the handler table never
/// holds two keys for the same action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Heartbeat,
    Acknowledgment,
    SyncRequest,
    ContentChanged,
    ElementSelected,
    ExecutionResult,
    ErrorOccurred,
    Suggestion,
    Command,
    ContextUpdate,
    ConversationUpdate,
    SurfaceUpdate,
    UserUpdate,
    SystemUpdate,
    Custom(String),
}

impl Action {
    /// Every action with a built-in default handler.
    pub const BUILTIN: [Action; 14] = [
        Action::Heartbeat,
        Action::Acknowledgment,
        Action::SyncRequest,
        Action::ContentChanged,
        Action::ElementSelected,
        Action::ExecutionResult,
        Action::ErrorOccurred,
        Action::Suggestion,
        Action::Command,
        Action::ContextUpdate,
        Action::ConversationUpdate,
        Action::SurfaceUpdate,
        Action::UserUpdate,
        Action::SystemUpdate,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Action::Heartbeat => "heartbeat",
            Action::Acknowledgment => "acknowledgment",
            Action::SyncRequest => "sync-request",
            Action::ContentChanged => "content-changed",
            Action::ElementSelected => "element-selected",
            Action::ExecutionResult => "execution-result",
            Action::ErrorOccurred => "error-occurred",
            Action::Suggestion => "suggestion",
            Action::Command => "command",
            Action::ContextUpdate => "context-update",
            Action::ConversationUpdate => "conversation-update",
            Action::SurfaceUpdate => "surface-update",
            Action::UserUpdate => "user-update",
            Action::SystemUpdate => "system-update",
            Action::Custom(name) => name,
        }
    }

    /// Whether the synchronizer buffers this action for reconciliation.
    pub fn is_state_update(&self) -> bool {
        matches!(
            self,
            Action::ConversationUpdate
                | Action::SurfaceUpdate
                | Action::UserUpdate
                | Action::SystemUpdate
        )
    }
}

impl From<&str> for Action {
    fn from(name: &str) -> Self {
        match name {
            "heartbeat" => Action::Heartbeat,
            "acknowledgment" => Action::Acknowledgment,
            "sync-request" => Action::SyncRequest,
            "content-changed" => Action::ContentChanged,
            "element-selected" => Action::ElementSelected,
            "execution-result" => Action::ExecutionResult,
            "error-occurred" => Action::ErrorOccurred,
            "suggestion" => Action::Suggestion,
            "command" => Action::Command,
            "context-update" => Action::ContextUpdate,
            "conversation-update" => Action::ConversationUpdate,
            "surface-update" | "canvas-update" => Action::SurfaceUpdate,
            "user-update" => Action::UserUpdate,
            "system-update" => Action::SystemUpdate,
            other => Action::Custom(other.to_string()),
        }
    }
}

impl From<String> for Action {
    fn from(name: String) -> Self {
        Action::from(name.as_str())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Custom(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The atomic unit of communication between the two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "MessageFields")]
pub struct Message {
    id: String,
    kind: MessageKind,
    action: Action,
    payload: Value,
    created_at: u64,
    source: Endpoint,
    target: Endpoint,
    priority: Priority,
    requires_ack: bool,
}

impl Message {
    /// Create a message with a fresh UUID id.
    ///
    /// Acknowledgment is required exactly when `priority` is critical; use
    /// [`Message::requiring_ack`] to opt lower priorities in.
    pub fn new(
        action: impl Into<Action>,
        payload: Value,
        priority: Priority,
        source: Endpoint,
        target: Endpoint,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: MessageKind::between(source, target),
            action: action.into(),
            payload,
            created_at: now_millis(),
            source,
            target,
            priority,
            requires_ack: priority == Priority::Critical,
        }
    }

    /// Replace the generated id with a caller-chosen one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the ack requirement. Critical messages always require one.
    pub fn requiring_ack(mut self, requires_ack: bool) -> Self {
        self.requires_ack = requires_ack || self.priority == Priority::Critical;
        self
    }

    /// Periodic liveness ping: bidirectional, low priority, no ack.
    pub fn heartbeat(source: Endpoint) -> Self {
        Self::new(
            Action::Heartbeat,
            json!({ "sentAt": now_millis() }),
            Priority::Low,
            source,
            Endpoint::Both,
        )
    }

    /// Heartbeat that records the channel it leaves on, so the echo can be
    /// credited to that channel.
    pub fn heartbeat_via(source: Endpoint, channel_id: &str) -> Self {
        Self::new(
            Action::Heartbeat,
            json!({ "sentAt": now_millis(), "channel": channel_id }),
            Priority::Low,
            source,
            Endpoint::Both,
        )
    }

    /// Reply to a received heartbeat. Carries the original `sentAt` back so
    /// the sender can measure the round trip.
    pub fn heartbeat_echo(ping: &Message, responder: Endpoint) -> Self {
        Self::new(
            Action::Heartbeat,
            json!({
                "sentAt": ping.heartbeat_sent_at().unwrap_or(ping.created_at),
                "channel": ping.heartbeat_channel(),
                "echo": true,
            }),
            Priority::Low,
            responder,
            ping.source,
        )
    }

    /// Acknowledgment for `original`, travelling back the way it came.
    pub fn acknowledgment(original: &Message) -> Self {
        Self::new(
            Action::Acknowledgment,
            json!({ "originalMessageId": original.id }),
            Priority::Low,
            original.target,
            original.source,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn source(&self) -> Endpoint {
        self.source
    }

    pub fn target(&self) -> Endpoint {
        self.target
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn requires_ack(&self) -> bool {
        self.requires_ack
    }

    /// Milliseconds elapsed since creation (0 if the sender's clock is ahead).
    pub fn age_ms(&self) -> u64 {
        now_millis().saturating_sub(self.created_at)
    }

    /// The id this message acknowledges, if it is an acknowledgment.
    pub fn acknowledged_id(&self) -> Option<&str> {
        if self.action != Action::Acknowledgment {
            return None;
        }
        self.payload.get("originalMessageId").and_then(Value::as_str)
    }

    pub fn is_heartbeat_echo(&self) -> bool {
        self.action == Action::Heartbeat
            && self.payload.get("echo").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Send time stamped into a heartbeat payload.
    pub fn heartbeat_sent_at(&self) -> Option<u64> {
        if self.action != Action::Heartbeat {
            return None;
        }
        self.payload.get("sentAt").and_then(Value::as_u64)
    }

    /// Channel a heartbeat left on, if the sender recorded it.
    pub fn heartbeat_channel(&self) -> Option<&str> {
        if self.action != Action::Heartbeat {
            return None;
        }
        self.payload.get("channel").and_then(Value::as_str)
    }

    /// Rebuild a message from already-validated parts (used by the codec).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: String,
        action: Action,
        payload: Value,
        created_at: u64,
        source: Endpoint,
        target: Endpoint,
        priority: Priority,
        requires_ack: bool,
    ) -> Self {
        Self {
            id,
            kind: MessageKind::between(source, target),
            action,
            payload,
            created_at,
            source,
            target,
            priority,
            requires_ack: requires_ack || priority == Priority::Critical,
        }
    }
}

/// Deserialized form of a [`Message`]. Goes through `from_parts` so the
/// ack rule and the derived kind hold for messages read from JSON too.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageFields {
    id: String,
    action: Action,
    #[serde(default)]
    payload: Value,
    created_at: u64,
    source: Endpoint,
    target: Endpoint,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    requires_ack: bool,
}

impl From<MessageFields> for Message {
    fn from(fields: MessageFields) -> Self {
        Message::from_parts(
            fields.id,
            fields.action,
            fields.payload,
            fields.created_at,
            fields.source,
            fields.target,
            fields.priority,
            fields.requires_ack,
        )
    }
}
