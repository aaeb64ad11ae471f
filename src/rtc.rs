use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;

use crate::config::Config;
use crate::connection::{
    ConnectionEvent, ConnectionEventSink, ConnectionFactory, ConnectionState, Direction,
    MediaConnection, RemoteTrack, SdpKind, SenderInfo, SessionDescription, SignalingState,
    TrackKind,
};
use crate::error::{MeshError, Result};
use crate::media::LocalTrack;
use crate::protocol::IceCandidate;

// ─── Factory ────────────────────────────────────────────────────────────────

/// Builds webrtc-rs peer connections sharing one API instance (codecs,
/// interceptors, UDP port range) and one ICE server list.
pub struct WebRtcConnectionFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnectionFactory {
    pub fn new(cfg: &Config) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if cfg.udp_port_min > 0 && cfg.udp_port_max > 0 {
            let ephemeral = EphemeralUDP::new(cfg.udp_port_min, cfg.udp_port_max)
                .map_err(|e| MeshError::Config(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
            info!("WebRTC UDP port range: {}-{}", cfg.udp_port_min, cfg.udp_port_max);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = cfg
            .ice_servers()
            .into_iter()
            .map(|s| RTCIceServer {
                urls: s.urls,
                username: s.username.unwrap_or_default(),
                credential: s.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(&self, events: ConnectionEventSink) -> Result<Arc<dyn MediaConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        wire_callbacks(&pc, &events);
        debug!(peer_id = %events.peer_id(), link_id = events.link_id(), "RTCPeerConnection created");
        Ok(Arc::new(WebRtcConnection { pc }))
    }
}

/// Route every stack callback into the session's event channel.
fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: &ConnectionEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            // `None` marks the end of gathering; nothing is relayed for it.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    sink.emit(ConnectionEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mline_index: init.sdp_mline_index,
                        sdp_mid: init.sdp_mid,
                    }));
                }
                Err(e) => warn!(peer_id = %sink.peer_id(), "local candidate not serializable: {e}"),
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            if let Some(state) = map_connection_state(state) {
                sink.emit(ConnectionEvent::StateChanged(state));
            }
        })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(kind) = map_codec_type(track.kind()) else {
                return;
            };
            sink.emit(ConnectionEvent::Track(RemoteTrack {
                id: track.id(),
                kind,
                stream_id: track.stream_id(),
            }));
            // Keep the receive pipeline draining; rendering is up to the
            // embedding application.
            tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
        })
    }));

    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(ConnectionEvent::NegotiationNeeded);
        })
    }));
}

// ─── Connection ─────────────────────────────────────────────────────────────

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcConnection {
    async fn transceiver(&self, index: usize) -> Result<Arc<RTCRtpTransceiver>> {
        self.pc
            .get_transceivers()
            .await
            .into_iter()
            .nth(index)
            .ok_or_else(|| MeshError::Connection(format!("no sender at {index}")))
    }
}

fn rtp_track(track: &LocalTrack) -> Arc<dyn TrackLocal + Send + Sync> {
    track.rtp_track()
}

#[async_trait]
impl MediaConnection for WebRtcConnection {
    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state()).unwrap_or(ConnectionState::New)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let desc = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        match self.signaling_state() {
            SignalingState::HaveLocalOffer => {
                let sdp = self
                    .pc
                    .pending_local_description()
                    .await
                    .map(|d| d.sdp)
                    .unwrap_or_default();
                self.pc.set_local_description(rollback_description(sdp)).await?;
            }
            SignalingState::HaveRemoteOffer => {
                let sdp = self
                    .pc
                    .pending_remote_description()
                    .await
                    .map(|d| d.sdp)
                    .unwrap_or_default();
                self.pc.set_remote_description(rollback_description(sdp)).await?;
            }
            other => return Err(MeshError::invalid_state("rollback", other)),
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        let mut out = Vec::new();
        for (index, transceiver) in self.pc.get_transceivers().await.into_iter().enumerate() {
            let Some(kind) = map_codec_type(transceiver.kind()) else {
                continue;
            };
            let track_id = transceiver
                .sender()
                .await
                .track()
                .await
                .map(|t| t.id().to_string());
            out.push(SenderInfo {
                index,
                kind,
                track_id,
                direction: map_direction(transceiver.direction()),
            });
        }
        out
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self.pc.add_track(rtp_track(track)).await?;
        // RTCP has to be read for interceptors (NACK, reports) to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn replace_track(&self, sender: usize, track: Option<&LocalTrack>) -> Result<()> {
        let transceiver = self.transceiver(sender).await?;
        transceiver
            .sender()
            .await
            .replace_track(track.map(rtp_track))
            .await?;
        Ok(())
    }

    async fn set_direction(&self, sender: usize, direction: Direction) -> Result<()> {
        let transceiver = self.transceiver(sender).await?;
        transceiver.set_direction(to_rtc_direction(direction)).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

fn rollback_description(sdp: String) -> RTCSessionDescription {
    let mut desc = RTCSessionDescription::default();
    desc.sdp_type = RTCSdpType::Rollback;
    desc.sdp = sdp;
    desc
}

// ─── State mapping ──────────────────────────────────────────────────────────

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => return None,
    })
}

fn map_codec_type(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

fn map_direction(direction: RTCRtpTransceiverDirection) -> Direction {
    match direction {
        RTCRtpTransceiverDirection::Sendrecv => Direction::SendRecv,
        RTCRtpTransceiverDirection::Sendonly => Direction::SendOnly,
        RTCRtpTransceiverDirection::Recvonly => Direction::RecvOnly,
        _ => Direction::Inactive,
    }
}

fn to_rtc_direction(direction: Direction) -> RTCRtpTransceiverDirection {
    match direction {
        Direction::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
        Direction::SendOnly => RTCRtpTransceiverDirection::Sendonly,
        Direction::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        Direction::Inactive => RTCRtpTransceiverDirection::Inactive,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
