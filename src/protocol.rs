//! Signaling wire vocabulary spoken with the relay.
//!
//! Every frame is a JSON object discriminated by its `type` field.  The relay
//! only forwards `offer` / `answer` / `candidate` between participants; the
//! roster messages (`joined`, `peer_joined`, `peer_left`) and the terminal
//! `room_closed` / `error` originate from the relay itself.

use serde::{Deserialize, Serialize};

use crate::roster::Participant;

// ─── ICE candidate payload ──────────────────────────────────────────────────

/// One trickled ICE candidate, shaped like the W3C `RTCIceCandidateInit`
/// dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

// ─── Server → client ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Assigns our own participant id and lists everyone already present.
    Joined {
        participant_id: String,
        #[serde(default)]
        participants: Vec<Participant>,
    },
    PeerJoined {
        participant: Participant,
    },
    PeerLeft {
        participant_id: String,
    },
    Offer {
        from: String,
        sdp: String,
    },
    Answer {
        from: String,
        sdp: String,
    },
    Candidate {
        from: String,
        candidate: IceCandidate,
    },
    RoomClosed {
        #[serde(default)]
        reason: String,
    },
    Error {
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    },
    /// Anything this client does not understand (keep-alives, extensions).
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::PeerJoined { .. } => "peer_joined",
            Self::PeerLeft { .. } => "peer_left",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::RoomClosed { .. } => "room_closed",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

// ─── Client → server ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Offer { to: String, sdp: String },
    Answer { to: String, sdp: String },
    Candidate { to: String, candidate: IceCandidate },
    Leave,
}

impl ClientMessage {
    /// Recipient participant id, if the message is addressed.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::Candidate { to, .. } => {
                Some(to)
            }
            Self::Leave => None,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
