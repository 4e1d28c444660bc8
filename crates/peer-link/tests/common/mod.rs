#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use peer_link::crypto::export_encoded;
use peer_link::{
    ChannelEvent, ChannelHandle, ChannelOptions, ChannelState, ClientMessage, DataChannel,
    IceCandidate, KeyPair, KeyProvider, NegotiationError, Negotiator, Relay, RelayError, RsaOaep,
    SdpKind, SessionDescription, TransportError,
};

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Small modulus keeps key generation fast; capacity is 62 bytes.
pub fn test_keys() -> Arc<RsaOaep> {
    Arc::new(RsaOaep::with_modulus_bits(1024))
}

pub async fn peer_key(keys: &RsaOaep) -> (KeyPair, String) {
    let pair = keys.generate_key_pair().await.expect("peer key pair");
    let encoded = export_encoded(keys, &pair.public).expect("export peer key");
    (pair, encoded)
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 udp 2122260223 192.168.1.{n} 5{n:04} typ host"
    ))
}

#[derive(Debug, Default)]
pub struct ScriptedRelay {
    sent: Mutex<Vec<ClientMessage>>,
    closed: AtomicBool,
}

impl ScriptedRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }
}

impl Relay for ScriptedRelay {
    fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    CreateChannel(String),
    Close,
}

#[derive(Default)]
pub struct FakeNegotiator {
    ops: Mutex<Vec<Op>>,
    failing_candidates: Mutex<HashSet<String>>,
    remote_gate: Mutex<Option<Arc<Notify>>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeNegotiator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                Op::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn fail_candidate(&self, candidate: &IceCandidate) {
        self.failing_candidates
            .lock()
            .insert(candidate.candidate.clone());
    }

    /// Makes the next `set_remote_description` wait until the returned
    /// notify is signalled.
    pub fn gate_remote_description(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.remote_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().clone()
    }

    fn record(&self, op: Op) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl Negotiator for FakeNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(Op::CreateOffer);
        Ok(SessionDescription::offer("v=0\r\no=- offer\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(Op::CreateAnswer);
        Ok(SessionDescription::answer("v=0\r\no=- answer\r\n"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(Op::SetLocal(description.kind));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let gate = self.remote_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record(Op::SetRemote(description.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if self.failing_candidates.lock().contains(&candidate.candidate) {
            return Err(NegotiationError(format!(
                "rejected candidate {}",
                candidate.candidate
            )));
        }
        self.record(Op::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn create_channel(
        &self,
        options: &ChannelOptions,
    ) -> Result<ChannelHandle, NegotiationError> {
        self.record(Op::CreateChannel(options.label.clone()));
        let (channel, handle) = FakeChannel::new(&options.label);
        self.channels.lock().push(channel);
        Ok(handle)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.record(Op::Close);
        Ok(())
    }
}

/// In-memory channel whose buffered amount grows with every send until the
/// test flushes it.
pub struct FakeChannel {
    label: String,
    state: Mutex<ChannelState>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    sent: Mutex<Vec<Bytes>>,
    fail_sends: AtomicBool,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl FakeChannel {
    pub fn new(label: &str) -> (Arc<Self>, ChannelHandle) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            events,
        });
        let handle = ChannelHandle {
            channel: channel.clone(),
            events: events_rx,
        };
        (channel, handle)
    }

    pub fn open(&self) {
        *self.state.lock() = ChannelState::Open;
        let _ = self.events.send(ChannelEvent::Open);
    }

    /// Marks the channel open without emitting the open notification.
    pub fn set_open(&self) {
        *self.state.lock() = ChannelState::Open;
    }

    pub fn set_buffered(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    /// Empties the send buffer and emits the buffer-low notification.
    pub fn flush(&self) {
        self.buffered.store(0, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::BufferLow);
    }

    pub fn deliver(&self, data: Bytes) {
        let _ = self.events.send(ChannelEvent::Message(data));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.events.send(ChannelEvent::Error(message.to_string()));
    }

    pub fn remote_close(&self) {
        *self.state.lock() = ChannelState::Closed;
        let _ = self.events.send(ChannelEvent::Closed);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn low_threshold(&self) -> usize {
        self.low_threshold.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send(&self, data: Bytes) -> Result<usize, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Channel("send rejected".into()));
        }
        let len = data.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        self.sent.lock().push(data);
        Ok(len)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<(), TransportError> {
        *self.state.lock() = ChannelState::Closed;
        Ok(())
    }
}
