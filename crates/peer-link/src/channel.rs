use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub const DEFAULT_CHANNEL_LABEL: &str = "fileTransfer";
pub const DEFAULT_MAX_RETRANSMITS: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    BufferLow,
    Message(Bytes),
    Error(String),
    Closed,
}

/// Parameters for the single data channel created per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub label: String,
    pub ordered: bool,
    /// Bounded retransmissions; `None` makes the channel fully reliable.
    pub max_retransmits: Option<u16>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            label: DEFAULT_CHANNEL_LABEL.to_string(),
            ordered: true,
            max_retransmits: Some(DEFAULT_MAX_RETRANSMITS),
        }
    }
}

/// Byte channel capability the chunk transport writes to.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    async fn send(&self, data: Bytes) -> Result<usize, TransportError>;
    /// Bytes queued for transmission but not yet sent.
    async fn buffered_amount(&self) -> usize;
    async fn set_buffered_amount_low_threshold(&self, threshold: usize);
    fn ready_state(&self) -> ChannelState;
    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel together with the stream of its lifecycle notifications.
pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("label", &self.channel.label())
            .field("state", &self.channel.ready_state())
            .finish()
    }
}
