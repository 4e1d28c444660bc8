//! Direct encrypted peer links negotiated through a relay.
//!
//! A [`NegotiationSession`] registers with a relay, exchanges offers,
//! answers and reachability candidates with one peer, and hands out the
//! negotiated data channel. An [`EncryptedChunkTransport`] then encrypts each
//! outbound chunk for the peer's public key and paces writes against the
//! channel's buffered amount; a [`ChunkReceiver`] decrypts the inbound side.

pub mod candidates;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod negotiation;
pub mod receiver;
pub mod relay;
pub mod session;
pub mod transport;

pub use channel::{ChannelEvent, ChannelHandle, ChannelOptions, ChannelState, DataChannel};
pub use config::{IceServer, SessionConfig};
pub use crypto::{KeyPair, KeyProvider, PrivateKey, PublicKey, RsaOaep};
pub use driver::{SessionDriver, SessionHandle};
pub use error::{CryptoError, NegotiationError, RelayError, SessionError, TransportError};
pub use negotiation::{
    IceCandidate, Negotiator, NegotiatorEvent, RtcNegotiator, SdpKind, SessionDescription,
};
pub use receiver::ChunkReceiver;
pub use relay::{ClientMessage, LocalRelay, Relay, RelayEvent, ServerMessage, WebSocketRelay};
pub use session::{
    LocalKey, NegotiationSession, RemoteKey, Role, SessionEvent, SessionSnapshot, SessionState,
};
pub use transport::{
    EncryptedChunkTransport, Payload, RemoteKeySource, TransportEvent, TransportPump,
};
