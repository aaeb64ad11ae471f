//! The media-connection seam.
//!
//! The negotiation engine never talks to a concrete WebRTC stack directly.
//! Everything it needs from a peer connection is captured by
//! [`MediaConnection`]; callbacks the stack would normally fire as ambient
//! event handlers are instead pushed as [`ConnectionEvent`]s through a
//! [`ConnectionEventSink`], tagged with the PeerLink generation that owns the
//! connection.  The production implementation lives in `rtc`; tests use an
//! in-memory double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::LocalTrack;
use crate::protocol::IceCandidate;

// ─── Signaling state ────────────────────────────────────────────────────────

/// Offer/answer state of one connection (subset of the W3C vocabulary the
/// engine cares about).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl SignalingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Connection state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ─── Tracks and senders ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

/// Transceiver direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn sends(&self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }
}

/// Snapshot of one sender (and its transceiver) on a connection.
///
/// `index` is the transceiver's position on the connection and is what the
/// mutation methods of [`MediaConnection`] take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    pub index: usize,
    pub kind: TrackKind,
    pub track_id: Option<String>,
    pub direction: Direction,
}

/// A track announced by the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

// ─── Session descriptions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// What a connection reports back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A local candidate was gathered and must be trickled to the peer.
    IceCandidate(IceCandidate),
    StateChanged(ConnectionState),
    /// A remote track arrived.
    Track(RemoteTrack),
    /// The connection's local configuration changed in a way that requires
    /// a new offer.
    NegotiationNeeded,
}

/// A [`ConnectionEvent`] addressed to the PeerLink generation that produced
/// it.
#[derive(Debug, Clone)]
pub struct PeerSignal {
    pub peer_id: String,
    pub link_id: u64,
    pub event: ConnectionEvent,
}

/// Handed to a connection at construction time; the only way the connection
/// can reach the engine.
#[derive(Debug, Clone)]
pub struct ConnectionEventSink {
    peer_id: String,
    link_id: u64,
    tx: mpsc::UnboundedSender<PeerSignal>,
}

impl ConnectionEventSink {
    pub fn new(peer_id: impl Into<String>, link_id: u64, tx: mpsc::UnboundedSender<PeerSignal>) -> Self {
        Self {
            peer_id: peer_id.into(),
            link_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Push an event.  Returns `false` once the session has gone away, in
    /// which case the event is dropped.
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.tx
            .send(PeerSignal {
                peer_id: self.peer_id.clone(),
                link_id: self.link_id,
                event,
            })
            .is_ok()
    }
}

// ─── MediaConnection ────────────────────────────────────────────────────────

/// The opaque connection handle of one PeerLink.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    async fn has_remote_description(&self) -> bool;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer to the current remote offer and install it as the
    /// local description.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Discard the pending offer (ours or the remote one), returning to
    /// `stable`.
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Every sender currently attached, in transceiver order.
    async fn senders(&self) -> Vec<SenderInfo>;

    /// Attach a track on a new (or reusable) send transceiver.
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Swap the track of an existing sender without renegotiating.
    async fn replace_track(&self, sender: usize, track: Option<&LocalTrack>) -> Result<()>;

    async fn set_direction(&self, sender: usize, direction: Direction) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds connections for new PeerLinks.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, events: ConnectionEventSink) -> Result<Arc<dyn MediaConnection>>;
}

// ─── Tests ──────────────────────────────────────────────────────────────────
