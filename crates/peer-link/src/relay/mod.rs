//! Relay protocol and the capability the session uses to reach it.
//!
//! The relay only ever carries registration, offers, answers and candidates.
//! Payload bytes travel on the negotiated data channel.

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::negotiation::{IceCandidate, SessionDescription};

pub mod local;
pub mod websocket;

pub use local::{LocalRelay, LocalRelayClient};
pub use websocket::WebSocketRelay;

/// Frames sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        public_key: String,
    },
    Offer {
        description: SessionDescription,
        from: String,
        to: String,
        public_key: String,
    },
    Answer {
        description: SessionDescription,
        from: String,
        to: String,
        public_key: String,
    },
    Candidate {
        candidate: IceCandidate,
        to: String,
    },
}

/// Frames delivered by the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage {
    Success {
        client_id: String,
    },
    Offer {
        description: SessionDescription,
        from: String,
        public_key: String,
    },
    Answer {
        description: SessionDescription,
        from: String,
        public_key: String,
    },
    Candidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Message(ServerMessage),
    Disconnected,
}

/// Outbound half of a relay connection; inbound frames arrive as
/// [`RelayEvent`]s on the receiver returned by each implementation's
/// constructor.
pub trait Relay: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), RelayError>;
}
