//! Encrypted, backpressured chunk transport over a negotiated data channel.
//!
//! Every chunk handed to [`EncryptedChunkTransport::send`] is queued,
//! encrypted for the peer's public key and written to the channel while the
//! channel's buffered amount stays at or below the configured threshold.
//! Draining resumes when the channel reports its buffer dropped low again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{ChannelEvent, ChannelState, DataChannel};
use crate::config::SessionConfig;
use crate::crypto::{KeyProvider, PublicKey};
use crate::error::{CryptoError, TransportError};
use crate::receiver::ChunkReceiver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text is sent as its UTF-8 bytes.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Payload::Text(text) => Bytes::from(text),
            Payload::Binary(data) => data,
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Binary(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(value))
    }
}

/// Where the transport obtains the key chunks are encrypted for.
#[async_trait]
pub trait RemoteKeySource: Send + Sync {
    async fn remote_public_key(&self) -> Result<PublicKey, TransportError>;
}

#[async_trait]
impl RemoteKeySource for PublicKey {
    async fn remote_public_key(&self) -> Result<PublicKey, TransportError> {
        Ok(self.clone())
    }
}

pub struct EncryptedChunkTransport {
    channel: Arc<dyn DataChannel>,
    keys: Arc<dyn KeyProvider>,
    remote_key: Arc<dyn RemoteKeySource>,
    threshold: usize,
    queue: Mutex<VecDeque<Payload>>,
    // Held for the whole drain so concurrent triggers coalesce; caches the
    // resolved remote key.
    drain_lock: tokio::sync::Mutex<Option<PublicKey>>,
    send_progress: AtomicU64,
}

impl EncryptedChunkTransport {
    /// Transport paced by `config.buffer_threshold`.
    pub async fn from_config(
        channel: Arc<dyn DataChannel>,
        keys: Arc<dyn KeyProvider>,
        remote_key: Arc<dyn RemoteKeySource>,
        config: &SessionConfig,
    ) -> Arc<Self> {
        Self::new(channel, keys, remote_key, config.buffer_threshold).await
    }

    pub async fn new(
        channel: Arc<dyn DataChannel>,
        keys: Arc<dyn KeyProvider>,
        remote_key: Arc<dyn RemoteKeySource>,
        threshold: usize,
    ) -> Arc<Self> {
        channel.set_buffered_amount_low_threshold(threshold).await;
        Arc::new(Self {
            channel,
            keys,
            remote_key,
            threshold,
            queue: Mutex::new(VecDeque::new()),
            drain_lock: tokio::sync::Mutex::new(None),
            send_progress: AtomicU64::new(0),
        })
    }

    /// Queues `payload` and drains as much of the queue as the channel allows.
    /// Returns the number of chunks written by this drain. A chunk larger
    /// than [`capacity`](Self::capacity) is dropped from the queue and
    /// reported as `Encryption(ChunkTooLarge)`; chunks behind it stay queued
    /// for the next drain.
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<usize, TransportError> {
        self.queue.lock().push_back(payload.into());
        self.drain().await
    }

    /// Splits `data` into chunks that fit the encryption capacity and queues
    /// them in order.
    pub async fn send_split(&self, data: impl Into<Bytes>) -> Result<usize, TransportError> {
        let mut data = data.into();
        let max = self.capacity().await?;
        if max == 0 {
            return Err(TransportError::Encryption(CryptoError::ChunkTooLarge {
                len: data.len(),
                max,
            }));
        }
        {
            let mut queue = self.queue.lock();
            while !data.is_empty() {
                let take = data.len().min(max);
                queue.push_back(Payload::Binary(data.split_to(take)));
            }
        }
        self.drain().await
    }

    /// Writes queued chunks until the queue empties, the channel is not
    /// open, or its buffer rises above the threshold. Stops at the first
    /// chunk that fails to encrypt and returns its error, so every failed
    /// chunk is reported by exactly one drain.
    pub async fn drain(&self) -> Result<usize, TransportError> {
        let mut cached_key = self.drain_lock.lock().await;
        if self.queue.lock().is_empty() {
            return Ok(0);
        }
        let state = self.channel.ready_state();
        if state != ChannelState::Open {
            tracing::debug!(
                target = "peer_link::transport",
                ?state,
                queued = self.queued(),
                "channel not open; leaving chunks queued"
            );
            return Ok(0);
        }
        let key = self.resolve_key(&mut cached_key).await?;

        let mut sent = 0;
        loop {
            let buffered = self.channel.buffered_amount().await;
            if buffered > self.threshold {
                tracing::trace!(
                    target = "peer_link::transport",
                    buffered,
                    threshold = self.threshold,
                    queued = self.queued(),
                    "buffer above threshold; pausing"
                );
                break;
            }
            let Some(payload) = self.queue.lock().pop_front() else {
                break;
            };
            let plaintext = payload.into_bytes();
            let ciphertext = match self.keys.encrypt(&key, &plaintext).await {
                Ok(ciphertext) => ciphertext,
                Err(err) => {
                    tracing::warn!(
                        target = "peer_link::transport",
                        len = plaintext.len(),
                        error = %err,
                        sent,
                        queued = self.queued(),
                        "chunk failed to encrypt; dropping it"
                    );
                    return Err(TransportError::Encryption(err));
                }
            };
            if let Err(err) = self.channel.send(Bytes::from(ciphertext)).await {
                tracing::warn!(target = "peer_link::transport", error = %err, "channel send failed");
                self.queue.lock().push_front(Payload::Binary(plaintext));
                return Err(err);
            }
            self.send_progress
                .fetch_add(plaintext.len() as u64, Ordering::Relaxed);
            sent += 1;
        }
        Ok(sent)
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.ready_state()
    }

    /// Plaintext bytes written to the channel so far.
    pub fn send_progress(&self) -> u64 {
        self.send_progress.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.queue.lock().clear();
        self.channel.close().await
    }

    /// Largest plaintext chunk the peer's key can encrypt.
    pub async fn capacity(&self) -> Result<usize, TransportError> {
        let mut cached_key = self.drain_lock.lock().await;
        let key = self.resolve_key(&mut cached_key).await?;
        Ok(self.keys.max_plaintext_len(&key))
    }

    async fn resolve_key(&self, cached: &mut Option<PublicKey>) -> Result<PublicKey, TransportError> {
        if let Some(key) = cached {
            return Ok(key.clone());
        }
        let key = self.remote_key.remote_public_key().await?;
        *cached = Some(key.clone());
        Ok(key)
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    ConnectFailed(String),
    ConnectionLost,
    Received(Bytes),
    ReceiveFailed(TransportError),
    SendFailed(TransportError),
}

/// Feeds channel notifications into a transport and surfaces them as
/// [`TransportEvent`]s.
pub struct TransportPump {
    transport: Arc<EncryptedChunkTransport>,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    receiver: Option<ChunkReceiver>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportPump {
    pub fn new(
        transport: Arc<EncryptedChunkTransport>,
        channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let pump = Self {
            transport,
            channel_events,
            receiver: None,
            events,
        };
        (pump, events_rx)
    }

    /// Decrypts inbound messages with `receiver` instead of passing them through.
    pub fn with_receiver(mut self, receiver: ChunkReceiver) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        while let Some(event) = self.channel_events.recv().await {
            self.handle(event).await;
        }
        tracing::debug!(target = "peer_link::transport", "channel event stream ended");
    }

    async fn handle(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                tracing::info!(target = "peer_link::transport", "data channel open");
                self.emit(TransportEvent::Connected);
                self.drain().await;
            }
            ChannelEvent::BufferLow => self.drain().await,
            ChannelEvent::Message(data) => {
                let event = match &self.receiver {
                    Some(receiver) => match receiver.open(&data).await {
                        Ok(plaintext) => TransportEvent::Received(plaintext),
                        Err(err) => TransportEvent::ReceiveFailed(err),
                    },
                    None => TransportEvent::Received(data),
                };
                self.emit(event);
            }
            ChannelEvent::Error(message) => {
                tracing::warn!(target = "peer_link::transport", %message, "data channel error");
                self.emit(TransportEvent::ConnectFailed(message));
            }
            ChannelEvent::Closed => {
                tracing::info!(target = "peer_link::transport", "data channel closed");
                self.emit(TransportEvent::ConnectionLost);
            }
        }
    }

    /// A chunk that fails to encrypt is reported and draining carries on
    /// with the chunks behind it.
    async fn drain(&self) {
        loop {
            match self.transport.drain().await {
                Ok(_) => break,
                Err(err @ TransportError::Encryption(_)) => {
                    self.emit(TransportEvent::SendFailed(err));
                }
                Err(err) => {
                    self.emit(TransportEvent::SendFailed(err));
                    break;
                }
            }
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}
