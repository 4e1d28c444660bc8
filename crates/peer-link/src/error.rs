use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("cryptographic provider unavailable: {0}")]
    Unavailable(String),
    #[error("malformed public key: {0}")]
    MalformedKey(String),
    #[error("chunk of {len} bytes exceeds scheme capacity of {max} bytes")]
    ChunkTooLarge { len: usize, max: usize },
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("relay connection closed")]
    Closed,
    #[error("relay protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
#[error("negotiation failed: {0}")]
pub struct NegotiationError(pub String);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("key generation failed: {0}")]
    KeyGeneration(#[source] CryptoError),
    #[error("remote public key rejected: {0}")]
    KeyImport(#[source] CryptoError),
    #[error("relay disconnected")]
    RelayDisconnected,
    #[error("negotiation already in progress (state {0:?})")]
    NegotiationInProgress(SessionState),
    #[error("session is not registered (state {0:?})")]
    NotRegistered(SessionState),
    #[error("{operation} is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("invalid target id {0:?}")]
    InvalidTarget(String),
    #[error("unexpected {kind} from {from}")]
    UnexpectedPeer { kind: &'static str, from: String },
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("session driver stopped")]
    DriverStopped,
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("chunk encryption failed: {0}")]
    Encryption(#[source] CryptoError),
    #[error("chunk decryption failed: {0}")]
    Decryption(#[source] CryptoError),
    #[error("session key material unavailable")]
    KeyUnavailable,
    #[error("transport closed")]
    Closed,
}
