//! Frame codec for messages crossing a transport.
//!
//! The envelope is bincode-encoded (standard config). The JSON payload rides
//! inside it as serde_json bytes, since bincode cannot decode a self-describing
//! `serde_json::Value` directly.
//!
//! ```text
//! ┌────┬────────┬────────────┬────────┬────────┬──────────┬─────┬──────────────┐
//! │ id │ action │ created_at │ source │ target │ priority │ ack │ payload json │
//! └────┴────────┴────────────┴────────┴────────┴──────────┴─────┴──────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::message::{Action, Endpoint, Message, Priority};

#[derive(Serialize, Deserialize)]
struct Frame {
    id: String,
    action: String,
    created_at: u64,
    source: Endpoint,
    target: Endpoint,
    priority: Priority,
    requires_ack: bool,
    payload: Vec<u8>,
}

/// Serialize a message to its wire frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(message.payload())
        .map_err(|e| CodecError::Serialization(e.to_string()))?;
    let frame = Frame {
        id: message.id().to_string(),
        action: message.action().as_str().to_string(),
        created_at: message.created_at(),
        source: message.source(),
        target: message.target(),
        priority: message.priority(),
        requires_ack: message.requires_ack(),
        payload,
    };
    bincode::serde::encode_to_vec(&frame, bincode::config::standard())
        .map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Parse a wire frame back into a message.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    let (frame, _): (Frame, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Deserialization(e.to_string()))?;
    let payload = serde_json::from_slice(&frame.payload)
        .map_err(|e| CodecError::Deserialization(e.to_string()))?;

    Ok(Message::from_parts(
        frame.id,
        Action::from(frame.action),
        payload,
        frame.created_at,
        frame.source,
        frame.target,
        frame.priority,
        frame.requires_ack,
    ))
}
