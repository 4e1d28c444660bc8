//! Registration and offer/answer negotiation for a single peer link.
//!
//! [`NegotiationSession`] is a plain state machine: every input (a command,
//! a relay frame, a negotiator notification or an elapsed deadline) is
//! applied through `&mut self`, so there is exactly one writer. The
//! [`crate::driver::SessionDriver`] owns a session and feeds it from the
//! three event streams.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::candidates::CandidateQueue;
use crate::channel::ChannelHandle;
use crate::config::SessionConfig;
use crate::crypto::{export_encoded, import_encoded, KeyPair, KeyProvider, PrivateKey, PublicKey};
use crate::error::{NegotiationError, SessionError, TransportError};
use crate::negotiation::{IceCandidate, Negotiator, NegotiatorEvent, SdpKind, SessionDescription};
use crate::relay::{ClientMessage, Relay, RelayEvent, ServerMessage};
use crate::transport::RemoteKeySource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registering,
    Registered,
    /// Offer sent, waiting for the target's answer.
    Offering,
    /// Our offer was answered by the target.
    Answered,
    /// We answered an incoming offer.
    AnswerSent,
    Closed,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Answered | SessionState::AnswerSent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug)]
pub enum SessionEvent {
    Registered { client_id: String },
    /// The relay connection went away; the session is closed.
    RegistrationLost,
    OfferSent { target_id: String },
    Connected { target_id: String, role: Role },
    /// The negotiated data channel, handed out once per session.
    Channel(ChannelHandle),
    Failed(SessionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub client_id: Option<String>,
    pub target_id: Option<String>,
    pub queued_candidates: usize,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Unregistered,
            client_id: None,
            target_id: None,
            queued_candidates: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Registration,
    Negotiation,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    phase: Phase,
}

/// The peer's public key once an offer or answer carrying it was accepted.
#[derive(Debug, Clone)]
pub struct RemoteKey {
    rx: watch::Receiver<Option<PublicKey>>,
}

impl RemoteKey {
    pub fn current(&self) -> Option<PublicKey> {
        self.rx.borrow().clone()
    }

    /// Waits until the peer's key is known.
    pub async fn wait(&self) -> Result<PublicKey, TransportError> {
        let mut rx = self.rx.clone();
        let key = (*rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TransportError::KeyUnavailable)?)
        .clone();
        key.ok_or(TransportError::KeyUnavailable)
    }
}

#[async_trait]
impl RemoteKeySource for RemoteKey {
    async fn remote_public_key(&self) -> Result<PublicKey, TransportError> {
        self.wait().await
    }
}

/// Our private key once registration generated it.
#[derive(Debug, Clone)]
pub struct LocalKey {
    rx: watch::Receiver<Option<Arc<PrivateKey>>>,
}

impl LocalKey {
    /// A source that always yields `key`.
    pub fn fixed(key: Arc<PrivateKey>) -> Self {
        let (_tx, rx) = watch::channel(Some(key));
        Self { rx }
    }

    pub async fn wait(&self) -> Result<Arc<PrivateKey>, TransportError> {
        let mut rx = self.rx.clone();
        let key = (*rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TransportError::KeyUnavailable)?)
        .clone();
        key.ok_or(TransportError::KeyUnavailable)
    }
}

pub struct NegotiationSession {
    config: SessionConfig,
    relay: Arc<dyn Relay>,
    negotiator: Arc<dyn Negotiator>,
    keys: Arc<dyn KeyProvider>,
    state: SessionState,
    client_id: Option<String>,
    target_id: Option<String>,
    key_pair: Option<KeyPair>,
    exported_key: Option<String>,
    remote_key_tx: watch::Sender<Option<PublicKey>>,
    local_key_tx: watch::Sender<Option<Arc<PrivateKey>>>,
    candidates: CandidateQueue,
    remote_description_applied: bool,
    // Local candidates are forwarded only once a target is known and our
    // description has been sent.
    emitter_armed: bool,
    pending_channel: Option<ChannelHandle>,
    negotiator_closed: bool,
    deadline: Option<Deadline>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl NegotiationSession {
    pub fn new(
        config: SessionConfig,
        relay: Arc<dyn Relay>,
        negotiator: Arc<dyn Negotiator>,
        keys: Arc<dyn KeyProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (remote_key_tx, _) = watch::channel(None);
        let (local_key_tx, _) = watch::channel(None);
        let session = Self {
            config,
            relay,
            negotiator,
            keys,
            state: SessionState::Unregistered,
            client_id: None,
            target_id: None,
            key_pair: None,
            exported_key: None,
            remote_key_tx,
            local_key_tx,
            candidates: CandidateQueue::new(),
            remote_description_applied: false,
            emitter_armed: false,
            pending_channel: None,
            negotiator_closed: false,
            deadline: None,
            events,
        };
        (session, events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn target_id(&self) -> Option<&str> {
        self.target_id.as_deref()
    }

    pub fn queued_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            client_id: self.client_id.clone(),
            target_id: self.target_id.clone(),
            queued_candidates: self.candidates.len(),
        }
    }

    pub fn remote_key(&self) -> RemoteKey {
        RemoteKey {
            rx: self.remote_key_tx.subscribe(),
        }
    }

    pub fn local_key(&self) -> LocalKey {
        LocalKey {
            rx: self.local_key_tx.subscribe(),
        }
    }

    pub fn local_public_key(&self) -> Option<&PublicKey> {
        self.key_pair.as_ref().map(|pair| &pair.public)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline.map(|deadline| deadline.at)
    }

    /// Generates our key pair and asks the relay for a client id.
    pub async fn register(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Unregistered => {}
            SessionState::Closed => return Err(SessionError::RelayDisconnected),
            state => {
                return Err(SessionError::InvalidState {
                    operation: "register",
                    state,
                });
            }
        }

        let pair = self.keys.generate_key_pair().await.map_err(|err| {
            tracing::error!(target = "peer_link::session", error = %err, "key generation failed");
            SessionError::KeyGeneration(err)
        })?;
        let exported =
            export_encoded(self.keys.as_ref(), &pair.public).map_err(SessionError::KeyGeneration)?;
        self.relay.send(ClientMessage::Register {
            public_key: exported.clone(),
        })?;

        self.local_key_tx.send_replace(Some(Arc::clone(&pair.private)));
        self.key_pair = Some(pair);
        self.exported_key = Some(exported);
        self.state = SessionState::Registering;
        self.arm_deadline(Phase::Registration);
        tracing::info!(target = "peer_link::session", "registering with relay");
        Ok(())
    }

    /// Starts negotiation towards `target_id` as the offering side.
    pub async fn connect_target(&mut self, target_id: &str) -> Result<(), SessionError> {
        match self.state {
            SessionState::Registered => {}
            SessionState::Unregistered | SessionState::Registering => {
                return Err(SessionError::NotRegistered(self.state));
            }
            SessionState::Closed => return Err(SessionError::RelayDisconnected),
            state => return Err(SessionError::NegotiationInProgress(state)),
        }

        let target = target_id.trim();
        if target.is_empty() || self.client_id.as_deref() == Some(target) {
            return Err(SessionError::InvalidTarget(target_id.to_string()));
        }
        let (client_id, public_key) = self.registration()?;

        // Candidates and descriptions from an earlier attempt must not leak
        // into this one.
        self.remote_description_applied = false;
        self.candidates.clear();
        self.remote_key_tx.send_replace(None);

        let channel = self.negotiator.create_channel(&self.config.channel).await?;
        if let Err(err) = self.send_offer(target, client_id, public_key).await {
            if let Err(close_err) = channel.channel.close().await {
                tracing::debug!(target = "peer_link::session", error = %close_err, "closing unused channel failed");
            }
            return Err(err);
        }

        self.pending_channel = Some(channel);
        self.target_id = Some(target.to_string());
        self.emitter_armed = true;
        self.state = SessionState::Offering;
        self.arm_deadline(Phase::Negotiation);
        tracing::info!(target = "peer_link::session", target_id = %target, "offer sent");
        self.emit(SessionEvent::OfferSent {
            target_id: target.to_string(),
        });
        Ok(())
    }

    pub async fn handle_relay_event(&mut self, event: RelayEvent) -> Result<(), SessionError> {
        match event {
            RelayEvent::Message(ServerMessage::Success { client_id }) => {
                self.on_registered(client_id)
            }
            RelayEvent::Message(ServerMessage::Offer {
                description,
                from,
                public_key,
            }) => self.on_offer(description, from, public_key).await,
            RelayEvent::Message(ServerMessage::Answer {
                description,
                from,
                public_key,
            }) => self.on_answer(description, from, public_key).await,
            RelayEvent::Message(ServerMessage::Candidate { candidate, from }) => {
                self.on_remote_candidate(candidate, from).await
            }
            RelayEvent::Message(ServerMessage::Error { message }) => {
                tracing::warn!(target = "peer_link::session", %message, "relay reported an error");
                Ok(())
            }
            RelayEvent::Disconnected => {
                self.on_disconnected().await;
                Ok(())
            }
        }
    }

    pub async fn handle_negotiator_event(
        &mut self,
        event: NegotiatorEvent,
    ) -> Result<(), SessionError> {
        match event {
            NegotiatorEvent::LocalCandidate(candidate) => {
                if self.state == SessionState::Closed {
                    return Ok(());
                }
                match (self.emitter_armed, self.target_id.clone()) {
                    (true, Some(to)) => {
                        tracing::trace!(target = "peer_link::session", to = %to, "forwarding local candidate");
                        self.relay.send(ClientMessage::Candidate { candidate, to })?;
                    }
                    _ => {
                        tracing::debug!(
                            target = "peer_link::session",
                            state = ?self.state,
                            "local candidate before negotiation started; dropping"
                        );
                    }
                }
                Ok(())
            }
            NegotiatorEvent::RemoteChannel(handle) => {
                tracing::debug!(target = "peer_link::session", channel = ?handle, "remote opened data channel");
                self.emit(SessionEvent::Channel(handle));
                Ok(())
            }
        }
    }

    /// Applies an elapsed registration or negotiation deadline.
    pub async fn on_deadline(&mut self, now: Instant) -> Result<(), SessionError> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };
        if now < deadline.at {
            return Ok(());
        }
        self.deadline = None;
        match (deadline.phase, self.state) {
            (Phase::Registration, SessionState::Registering) => {
                tracing::warn!(target = "peer_link::session", "registration timed out");
                self.state = SessionState::Unregistered;
                self.drop_keys();
                Err(SessionError::Timeout("registration"))
            }
            (Phase::Negotiation, SessionState::Offering) => {
                tracing::warn!(
                    target = "peer_link::session",
                    target_id = ?self.target_id,
                    "negotiation timed out"
                );
                self.reset_negotiation().await;
                self.state = SessionState::Registered;
                Err(SessionError::Timeout("negotiation"))
            }
            _ => Ok(()),
        }
    }

    /// Tears the session down; later calls are no-ops.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.negotiator_closed {
            return Ok(());
        }
        self.reset_negotiation().await;
        self.state = SessionState::Closed;
        self.deadline = None;
        self.drop_keys();
        self.negotiator_closed = true;
        self.negotiator.close().await?;
        tracing::info!(target = "peer_link::session", "session closed");
        Ok(())
    }

    pub(crate) fn report_failure(&self, err: SessionError) {
        tracing::warn!(target = "peer_link::session", error = %err, state = ?self.state, "session operation failed");
        self.emit(SessionEvent::Failed(err));
    }

    fn on_registered(&mut self, client_id: String) -> Result<(), SessionError> {
        if self.state != SessionState::Registering {
            return Err(SessionError::InvalidState {
                operation: "registration result",
                state: self.state,
            });
        }
        tracing::info!(target = "peer_link::session", client_id = %client_id, "registered with relay");
        self.client_id = Some(client_id.clone());
        self.state = SessionState::Registered;
        self.deadline = None;
        self.emit(SessionEvent::Registered { client_id });
        Ok(())
    }

    async fn on_offer(
        &mut self,
        description: SessionDescription,
        from: String,
        public_key: String,
    ) -> Result<(), SessionError> {
        match self.state {
            SessionState::Registered => {}
            SessionState::Unregistered | SessionState::Registering => {
                return Err(SessionError::NotRegistered(self.state));
            }
            SessionState::Closed => return Err(SessionError::RelayDisconnected),
            state => {
                tracing::warn!(target = "peer_link::session", from = %from, ?state, "rejecting offer during negotiation");
                return Err(SessionError::NegotiationInProgress(state));
            }
        }
        if description.kind != SdpKind::Offer {
            return Err(NegotiationError(format!("expected offer from {from}")).into());
        }
        let remote_key = import_encoded(self.keys.as_ref(), &public_key).map_err(|err| {
            tracing::warn!(target = "peer_link::session", from = %from, error = %err, "offer carried an unusable key");
            SessionError::KeyImport(err)
        })?;
        let (client_id, local_key) = self.registration()?;

        self.target_id = Some(from.clone());
        if let Err(err) = self.send_answer(description, client_id, &from, local_key).await {
            tracing::warn!(target = "peer_link::session", from = %from, error = %err, "answering offer failed");
            self.reset_negotiation().await;
            return Err(err);
        }
        self.remote_key_tx.send_replace(Some(remote_key));
        self.emitter_armed = true;
        self.state = SessionState::AnswerSent;
        tracing::info!(target = "peer_link::session", from = %from, "answered incoming offer");
        self.emit(SessionEvent::Connected {
            target_id: from,
            role: Role::Answerer,
        });
        Ok(())
    }

    async fn on_answer(
        &mut self,
        description: SessionDescription,
        from: String,
        public_key: String,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Offering {
            return Err(SessionError::InvalidState {
                operation: "answer",
                state: self.state,
            });
        }
        if self.target_id.as_deref() != Some(from.as_str()) {
            return Err(SessionError::UnexpectedPeer {
                kind: "answer",
                from,
            });
        }
        if description.kind != SdpKind::Answer {
            return Err(NegotiationError(format!("expected answer from {from}")).into());
        }
        let remote_key = import_encoded(self.keys.as_ref(), &public_key).map_err(|err| {
            tracing::warn!(target = "peer_link::session", from = %from, error = %err, "answer carried an unusable key");
            SessionError::KeyImport(err)
        })?;

        self.apply_remote_description(description).await?;
        self.remote_key_tx.send_replace(Some(remote_key));
        self.state = SessionState::Answered;
        self.deadline = None;
        tracing::info!(target = "peer_link::session", from = %from, "offer answered");
        self.emit(SessionEvent::Connected {
            target_id: from,
            role: Role::Offerer,
        });
        if let Some(channel) = self.pending_channel.take() {
            self.emit(SessionEvent::Channel(channel));
        }
        Ok(())
    }

    async fn on_remote_candidate(
        &mut self,
        candidate: IceCandidate,
        from: Option<String>,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if let (Some(from), Some(target)) = (from.as_deref(), self.target_id.as_deref()) {
            if from != target {
                return Err(SessionError::UnexpectedPeer {
                    kind: "candidate",
                    from: from.to_string(),
                });
            }
        }
        if self.remote_description_applied {
            self.negotiator.add_ice_candidate(candidate).await?;
        } else {
            self.candidates.push(candidate);
            tracing::debug!(
                target = "peer_link::session",
                queued = self.candidates.len(),
                "buffering candidate until remote description is applied"
            );
        }
        Ok(())
    }

    async fn on_disconnected(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        tracing::info!(target = "peer_link::session", state = ?self.state, "relay connection lost");
        self.reset_negotiation().await;
        self.state = SessionState::Closed;
        self.deadline = None;
        self.drop_keys();
        self.emit(SessionEvent::RegistrationLost);
    }

    async fn send_offer(
        &self,
        target: &str,
        client_id: String,
        public_key: String,
    ) -> Result<(), SessionError> {
        let offer = self.negotiator.create_offer().await?;
        self.negotiator.set_local_description(offer.clone()).await?;
        self.relay.send(ClientMessage::Offer {
            description: offer,
            from: client_id,
            to: target.to_string(),
            public_key,
        })?;
        Ok(())
    }

    async fn send_answer(
        &mut self,
        offer: SessionDescription,
        client_id: String,
        to: &str,
        public_key: String,
    ) -> Result<(), SessionError> {
        self.apply_remote_description(offer).await?;
        let answer = self.negotiator.create_answer().await?;
        self.negotiator.set_local_description(answer.clone()).await?;
        self.relay.send(ClientMessage::Answer {
            description: answer,
            from: client_id,
            to: to.to_string(),
            public_key,
        })?;
        Ok(())
    }

    async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        self.negotiator.set_remote_description(description).await?;
        self.remote_description_applied = true;

        let pending = self.candidates.take_all();
        if pending.is_empty() {
            return Ok(());
        }
        let total = pending.len();
        for candidate in pending {
            if let Err(err) = self.negotiator.add_ice_candidate(candidate).await {
                tracing::warn!(target = "peer_link::session", error = %err, "failed to apply buffered candidate");
            }
        }
        tracing::debug!(target = "peer_link::session", total, "applied buffered candidates");
        Ok(())
    }

    async fn reset_negotiation(&mut self) {
        self.target_id = None;
        self.emitter_armed = false;
        self.remote_description_applied = false;
        self.candidates.clear();
        self.remote_key_tx.send_replace(None);
        if let Some(handle) = self.pending_channel.take() {
            if let Err(err) = handle.channel.close().await {
                tracing::debug!(target = "peer_link::session", error = %err, "closing abandoned channel failed");
            }
        }
    }

    fn drop_keys(&mut self) {
        self.key_pair = None;
        self.exported_key = None;
        self.local_key_tx.send_replace(None);
    }

    fn registration(&self) -> Result<(String, String), SessionError> {
        match (&self.client_id, &self.exported_key) {
            (Some(client_id), Some(key)) => Ok((client_id.clone(), key.clone())),
            _ => Err(SessionError::NotRegistered(self.state)),
        }
    }

    fn arm_deadline(&mut self, phase: Phase) {
        let timeout = match phase {
            Phase::Registration => self.config.registration_timeout,
            Phase::Negotiation => self.config.negotiation_timeout,
        };
        self.deadline = Some(Deadline {
            at: Instant::now() + timeout,
            phase,
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
