//! Structured events describing fabric activity.
//!
//! Textual diagnostics go through `tracing`; these serde-derived types are
//! for embedders that ship events into their own introspection pipeline.
//! Emission is callback-based and optional.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An observed frame crossing a transport.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct MessageEvent {
    /// True for a send, false for a receive.
    pub is_send: bool,
    /// Payload length in bytes, excluding framing.
    pub length: usize,
}

/// A transport thread starting or stopping.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct StateEvent {
    /// True for the send thread, false for the receive thread.
    pub send: bool,
    /// True when the thread starts, false when it stops.
    pub start: bool,
}

/// Any fabric event.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum FabricEvent {
    /// An observed frame.
    Message(MessageEvent),
    /// A thread transition.
    State(StateEvent),
}

impl From<MessageEvent> for FabricEvent {
    fn from(event: MessageEvent) -> FabricEvent {
        FabricEvent::Message(event)
    }
}

impl From<StateEvent> for FabricEvent {
    fn from(event: StateEvent) -> FabricEvent {
        FabricEvent::State(event)
    }
}

/// Receives fabric events; shared across the transport's threads.
pub type EventLogger = Arc<dyn Fn(FabricEvent) + Send + Sync>;
