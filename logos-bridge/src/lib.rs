//! # logos-bridge: Bidirectional messaging between an AI producer and a UI consumer
//!
//! Two peers exchange prioritized, optionally acknowledged messages over
//! whichever registered channel currently scores best, and keep four shared
//! state partitions reconciled on a fixed tick.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    frames (bincode)    ┌──────────────┐
//! │ Bridge       │ ◄────────────────────► │ Bridge       │
//! │ (producer)   │   best-scoring channel │ (consumer)   │
//! └──────┬───────┘                        └──────┬───────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────────┐
//! │ MessageRouter│   │ChannelRegistry│  │StateSynchronizer│
//! │ handlers +   │   │ scoring +     │  │ pending updates │
//! │ retry queues │   │ telemetry     │  │ + conflicts     │
//! └──────┬───────┘   └──────┬────────┘  └───────┬─────────┘
//!        └──────────────────┼───────────────────┘
//!                     ┌─────┴─────┐
//!                     │ EventBus  │
//!                     │ (fan-out) │
//!                     └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`message`]: Message envelope, actions, priorities
//! - [`router`]: Handler table, delivery queues, retry sweep
//! - [`conflict`]: Pure conflict detection and resolution
//! - [`sync`]: Buffered reconciliation of shared state
//! - [`channel`]: Channel scoring and connection telemetry
//! - [`transport`]: Transport seam plus an in-process implementation
//! - [`codec`]: Wire frames
//! - [`bridge`]: The facade tying it all together

pub mod bridge;
pub mod channel;
pub mod codec;
pub mod config;
pub mod conflict;
pub mod error;
pub mod events;
pub mod message;
pub mod router;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use bridge::Bridge;
pub use channel::{
    Channel, ChannelKind, ChannelRegistry, ConnectionState, ConnectionStatus, DeliveryOutcome,
};
pub use config::BridgeConfig;
pub use conflict::{ConflictRecord, ConflictType, Partition};
pub use error::{BridgeError, CodecError, HandlerError, TransportError};
pub use events::{BridgeEvent, EventBus, EventStats};
pub use message::{Action, Endpoint, Message, MessageKind, Priority};
pub use router::{
    DeliveryStatus, HandlerResult, MessageHandler, MessageRouter, QueueCounts, RetrySweep,
    RouteOutcome, RouterStats,
};
pub use sync::{StateSynchronizer, SyncState, TickReport};
pub use transport::{InProcessTransport, Transport, TransportStats};
