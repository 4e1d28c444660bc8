//! `Negotiator` and `DataChannel` backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{IceCandidate, Negotiator, NegotiatorEvent, SdpKind, SessionDescription};
use crate::channel::{ChannelEvent, ChannelHandle, ChannelOptions, ChannelState, DataChannel};
use crate::config::{IceServer, SessionConfig};
use crate::error::{NegotiationError, TransportError};

fn negotiation_error(err: webrtc::Error) -> NegotiationError {
    NegotiationError(err.to_string())
}

pub struct RtcNegotiator {
    pc: Arc<RTCPeerConnection>,
}

fn rtc_ice_servers(ice_servers: &[IceServer]) -> Vec<RTCIceServer> {
    ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

impl RtcNegotiator {
    /// Peer connection using the ICE servers from `config`.
    pub async fn from_config(
        config: &SessionConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<NegotiatorEvent>), NegotiationError> {
        Self::new(&config.ice_servers).await
    }

    pub async fn new(
        ice_servers: &[IceServer],
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<NegotiatorEvent>), NegotiationError> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(negotiation_error)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!(target = "peer_link::rtc", "local candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(NegotiatorEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "peer_link::rtc", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let channel_tx = events_tx;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = channel_tx.clone();
            Box::pin(async move {
                tracing::debug!(target = "peer_link::rtc", label = dc.label(), "remote data channel announced");
                let handle = RtcDataChannel::attach(dc).await;
                let _ = tx.send(NegotiatorEvent::RemoteChannel(handle));
            })
        }));

        Ok((Arc::new(Self { pc }), events_rx))
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(negotiation_error)
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(NegotiationError(format!(
                "unsupported description type {other}"
            )));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

#[async_trait]
impl Negotiator for RtcNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(negotiation_error)
    }

    async fn create_channel(
        &self,
        options: &ChannelOptions,
    ) -> Result<ChannelHandle, NegotiationError> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_retransmits: options.max_retransmits,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&options.label, Some(init))
            .await
            .map_err(negotiation_error)?;
        Ok(RtcDataChannel::attach(dc).await)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await.map_err(negotiation_error)
    }
}

pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    /// Wraps `dc` and routes its callbacks into a single event stream.
    pub async fn attach(dc: Arc<RTCDataChannel>) -> ChannelHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let close_tx = tx.clone();
        dc.on_close(Box::new(move || {
            let _ = close_tx.send(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        let error_tx = tx.clone();
        dc.on_error(Box::new(move |err: webrtc::Error| {
            let _ = error_tx.send(ChannelEvent::Error(err.to_string()));
            Box::pin(async {})
        }));

        let message_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = message_tx.send(ChannelEvent::Message(msg.data));
            Box::pin(async {})
        }));

        let low_tx = tx.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let _ = low_tx.send(ChannelEvent::BufferLow);
            Box::pin(async {})
        }))
        .await;

        if dc.ready_state() == RTCDataChannelState::Open {
            let _ = tx.send(ChannelEvent::Open);
        }

        ChannelHandle {
            channel: Arc::new(Self { dc }),
            events: rx,
        }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    async fn send(&self, data: Bytes) -> Result<usize, TransportError> {
        self.dc
            .send(&data)
            .await
            .map_err(|err| TransportError::Channel(err.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    fn ready_state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc
            .close()
            .await
            .map_err(|err| TransportError::Channel(err.to_string()))
    }
}
