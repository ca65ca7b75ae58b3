use thiserror::Error;

use crate::message::Action;

/// Failure reported by a transport for one send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    #[error("Send rejected by channel {channel}: {reason}")]
    Rejected { channel: String, reason: String },
    #[error("Send timed out on channel {0}")]
    Timeout(String),
}

/// Frame encoding/decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Error returned by an action handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        Self(reason.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// No handler registered for the action. The message is retried.
    #[error("No handler registered for action '{0}'")]
    NoHandler(Action),

    /// Channel selection found nothing. Surfaced to the sender, never retried.
    #[error("No channel available")]
    NoChannelAvailable,

    #[error("Handler for '{action}' failed: {reason}")]
    HandlerExecution { action: Action, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A delivered message went unacknowledged for a full ack timeout.
    #[error("No acknowledgment for message {0}")]
    AckTimeout(String),

    #[error("Action '{0}' is not a state update")]
    NotAnUpdate(Action),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Bridge has been destroyed")]
    Destroyed,
}

impl BridgeError {
    /// Whether the message stays in the retry cycle after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::NoHandler(_)
                | BridgeError::HandlerExecution { .. }
                | BridgeError::Transport(_)
                | BridgeError::AckTimeout(_)
        )
    }
}
