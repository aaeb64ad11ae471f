// src/events.rs
//
// Meeting event stream.
//
// Everything an embedding application would want to render (meeting state,
// roster changes, per-peer connection state, arriving remote tracks, local
// media toggles, terminal errors) is published as a `MeetingEvent` on a
// broadcast `EventBus`.  The session actor is the only publisher.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::connection::{ConnectionState, RemoteTrack, TrackKind};
use crate::media::LocalMediaState;
use crate::session::MeetingState;

// ─── Event types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "meeting.state_changed")]
    MeetingStateChanged,
    #[serde(rename = "participant.joined")]
    ParticipantJoined,
    #[serde(rename = "participant.left")]
    ParticipantLeft,
    #[serde(rename = "peer.connection_state")]
    PeerConnectionState,
    #[serde(rename = "track.remote")]
    RemoteTrack,
    #[serde(rename = "media.local_changed")]
    LocalMediaChanged,
    #[serde(rename = "meeting.error")]
    MeetingError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MeetingStateChanged => "meeting.state_changed",
            Self::ParticipantJoined => "participant.joined",
            Self::ParticipantLeft => "participant.left",
            Self::PeerConnectionState => "peer.connection_state",
            Self::RemoteTrack => "track.remote",
            Self::LocalMediaChanged => "media.local_changed",
            Self::MeetingError => "meeting.error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Payloads ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatePayload {
    pub room_id: String,
    pub state: MeetingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantPayload {
    pub room_id: String,
    pub participant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionPayload {
    pub room_id: String,
    pub peer_id: String,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackPayload {
    pub room_id: String,
    pub peer_id: String,
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalMediaPayload {
    pub room_id: String,
    #[serde(flatten)]
    pub media: LocalMediaState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub room_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    State(StatePayload),
    Participant(ParticipantPayload),
    Connection(ConnectionPayload),
    Track(TrackPayload),
    LocalMedia(LocalMediaPayload),
    Error(ErrorPayload),
}

// ─── Envelope ───────────────────────────────────────────────────────────────

/// One published event.
///
/// ```json
/// {
///   "id":         "evt_5f0c...",
///   "type":       "peer.connection_state",
///   "created_at": "2026-03-02T09:14:07.512Z",
///   "data": { "room_id": "standup", "peer_id": "alice", "state": "connected" }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct MeetingEvent {
    /// `evt_<uuid-v4>`.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    pub data: EventPayload,
}

impl MeetingEvent {
    pub fn state_changed(room_id: &str, state: MeetingState, reason: Option<String>) -> Self {
        Self::new(
            EventType::MeetingStateChanged,
            EventPayload::State(StatePayload {
                room_id: room_id.to_string(),
                state,
                reason,
            }),
        )
    }

    pub fn participant_joined(room_id: &str, participant_id: &str, display_name: &str) -> Self {
        Self::new(
            EventType::ParticipantJoined,
            EventPayload::Participant(ParticipantPayload {
                room_id: room_id.to_string(),
                participant_id: participant_id.to_string(),
                display_name: Some(display_name.to_string()),
            }),
        )
    }

    pub fn participant_left(room_id: &str, participant_id: &str) -> Self {
        Self::new(
            EventType::ParticipantLeft,
            EventPayload::Participant(ParticipantPayload {
                room_id: room_id.to_string(),
                participant_id: participant_id.to_string(),
                display_name: None,
            }),
        )
    }

    pub fn connection_state(room_id: &str, peer_id: &str, state: ConnectionState) -> Self {
        Self::new(
            EventType::PeerConnectionState,
            EventPayload::Connection(ConnectionPayload {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                state,
            }),
        )
    }

    pub fn remote_track(room_id: &str, peer_id: &str, track: &RemoteTrack) -> Self {
        Self::new(
            EventType::RemoteTrack,
            EventPayload::Track(TrackPayload {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                track_id: track.id.clone(),
                stream_id: track.stream_id.clone(),
                kind: track.kind,
            }),
        )
    }

    pub fn local_media(room_id: &str, media: LocalMediaState) -> Self {
        Self::new(
            EventType::LocalMediaChanged,
            EventPayload::LocalMedia(LocalMediaPayload {
                room_id: room_id.to_string(),
                media,
            }),
        )
    }

    pub fn error(room_id: &str, code: &str, message: &str) -> Self {
        Self::new(
            EventType::MeetingError,
            EventPayload::Error(ErrorPayload {
                room_id: room_id.to_string(),
                code: code.to_string(),
                message: message.to_string(),
            }),
        )
    }

    fn new(event_type: EventType, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            data,
        }
    }

    /// Peer the event is about, if any.
    pub fn peer_id(&self) -> Option<&str> {
        match &self.data {
            EventPayload::Participant(p) => Some(&p.participant_id),
            EventPayload::Connection(p) => Some(&p.peer_id),
            EventPayload::Track(p) => Some(&p.peer_id),
            EventPayload::State(_) | EventPayload::LocalMedia(_) | EventPayload::Error(_) => None,
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Fan-out of [`MeetingEvent`]s.  Cheap to clone.
///
/// Subscribers lagging more than the capacity skip events
/// (`broadcast::error::RecvError::Lagged`).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeetingEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        Self { tx }
    }

    /// Publish an event; returns how many subscribers will see it.  Having
    /// none is not an error.
    pub fn emit(&self, event: MeetingEvent) -> usize {
        debug!(event_type = %event.event_type, event_id = %event.id, "event emitted");
        self.tx.send(event).unwrap_or(0)
    }

    /// Receiver for every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MeetingEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_names() {
        let json = serde_json::to_string(&EventType::PeerConnectionState).unwrap();
        assert_eq!(json, "\"peer.connection_state\"");
        let parsed: EventType = serde_json::from_str("\"track.remote\"").unwrap();
        assert_eq!(parsed, EventType::RemoteTrack);
        assert_eq!(EventType::MeetingError.to_string(), "meeting.error");
    }

    #[test]
    fn envelope_shape() {
        let evt = MeetingEvent::connection_state("standup", "alice", ConnectionState::Connected);
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "peer.connection_state");
        assert_eq!(json["data"]["peer_id"], "alice");
        assert_eq!(json["data"]["state"], "connected");
        assert!(evt.id.starts_with("evt_"));
        assert_eq!(evt.peer_id(), Some("alice"));
    }

    #[test]
    fn local_media_is_flattened() {
        let evt = MeetingEvent::local_media(
            "standup",
            LocalMediaState {
                mic_enabled: false,
                camera_enabled: true,
                screen_sharing: true,
            },
        );
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["data"]["mic_enabled"], false);
        assert_eq!(json["data"]["screen_sharing"], true);
        assert_eq!(evt.peer_id(), None);
    }

    #[tokio::test]
    async fn bus_fans_out() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let n = bus.emit(MeetingEvent::participant_left("standup", "carol"));
        assert_eq!(n, 2);
        assert_eq!(a.recv().await.unwrap().id, b.recv().await.unwrap().id);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(MeetingEvent::error("r", "room_closed", "bye")), 0);
    }
}
