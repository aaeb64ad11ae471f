//! In-memory doubles for the media-connection seam.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::connection::{
    ConnectionEvent, ConnectionEventSink, ConnectionFactory, ConnectionState, Direction,
    MediaConnection, PeerSignal, SdpKind, SenderInfo, SessionDescription, SignalingState,
    TrackKind,
};
use crate::error::{MeshError, Result};
use crate::media::LocalTrack;
use crate::protocol::IceCandidate;

// ─── FakeConnection ─────────────────────────────────────────────────────────

/// A connection that follows the W3C offer/answer state machine without
/// any media underneath.
///
/// Every mutating call is recorded in an op log.  Adding a track or flipping
/// a direction emits `NegotiationNeeded` when stable (a change made mid
/// exchange rides along with the answer); replacing a track never does.
/// Like a browser, repeated changes before the next offer fire only once.
pub struct FakeConnection {
    sink: ConnectionEventSink,
    inner: Mutex<FakeState>,
}

struct FakeState {
    signaling: SignalingState,
    connection: ConnectionState,
    remote_description: bool,
    /// Whether a remote description existed before the pending remote offer.
    stable_remote: bool,
    senders: Vec<SenderInfo>,
    candidates: Vec<IceCandidate>,
    rejected: HashSet<String>,
    ops: Vec<String>,
    offers: u32,
    invalid_offers: bool,
    negotiation_pending: bool,
}

impl FakeConnection {
    pub fn new(sink: ConnectionEventSink) -> Arc<Self> {
        Arc::new(Self {
            sink,
            inner: Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                remote_description: false,
                stable_remote: false,
                senders: Vec::new(),
                candidates: Vec::new(),
                rejected: HashSet::new(),
                ops: Vec::new(),
                offers: 0,
                invalid_offers: false,
                negotiation_pending: false,
            }),
        })
    }

    /// A connection not owned by any registry; its events land on the
    /// returned receiver.
    pub fn detached() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(ConnectionEventSink::new("peer", 0, tx)), rx)
    }

    pub fn link_id(&self) -> u64 {
        self.sink.link_id()
    }

    /// Push an event as if the stack had fired it.
    pub fn fire(&self, event: ConnectionEvent) -> bool {
        if let ConnectionEvent::StateChanged(state) = event {
            self.inner.lock().unwrap().connection = state;
        }
        self.sink.emit(event)
    }

    pub fn ops(&self) -> Vec<String> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.inner.lock().unwrap().ops.clear();
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().unwrap().candidates.clone()
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.inner.lock().unwrap().rejected.insert(candidate.to_string());
    }

    pub fn fail_offers_with_invalid_state(&self, fail: bool) {
        self.inner.lock().unwrap().invalid_offers = fail;
    }

    pub fn push_sender(&self, kind: TrackKind, track_id: Option<String>, direction: Direction) {
        let mut st = self.inner.lock().unwrap();
        let index = st.senders.len();
        st.senders.push(SenderInfo {
            index,
            kind,
            track_id,
            direction,
        });
    }

    pub fn sender_count(&self) -> usize {
        self.inner.lock().unwrap().senders.len()
    }

    pub fn has_track(&self, track_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .senders
            .iter()
            .any(|s| s.track_id.as_deref() == Some(track_id))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().signaling == SignalingState::Closed
    }

    fn log(st: &mut FakeState, op: impl Into<String>) {
        st.ops.push(op.into());
    }

    /// Whether a negotiation-needed event should fire now.
    fn raise_negotiation(st: &mut FakeState) -> bool {
        if st.signaling != SignalingState::Stable || st.negotiation_pending {
            return false;
        }
        st.negotiation_pending = true;
        true
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    fn signaling_state(&self) -> SignalingState {
        self.inner.lock().unwrap().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.lock().unwrap().connection
    }

    async fn has_remote_description(&self) -> bool {
        self.inner.lock().unwrap().remote_description
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut st = self.inner.lock().unwrap();
        if st.invalid_offers {
            return Err(MeshError::invalid_state("create_offer", st.signaling));
        }
        match st.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {}
            other => return Err(MeshError::invalid_state("create_offer", other)),
        }
        Self::log(&mut st, "create_offer");
        st.offers += 1;
        st.negotiation_pending = false;
        st.signaling = SignalingState::HaveLocalOffer;
        Ok(SessionDescription::offer(format!("v=0 offer {}", st.offers)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut st = self.inner.lock().unwrap();
        if st.signaling != SignalingState::HaveRemoteOffer {
            return Err(MeshError::invalid_state("create_answer", st.signaling));
        }
        Self::log(&mut st, "create_answer");
        st.signaling = SignalingState::Stable;
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut st = self.inner.lock().unwrap();
        let next = match (description.kind, st.signaling) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveRemoteOffer
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (_, other) => return Err(MeshError::invalid_state("set_remote_description", other)),
        };
        let label = match description.kind {
            SdpKind::Offer => "set_remote:offer",
            SdpKind::Answer => "set_remote:answer",
        };
        Self::log(&mut st, label);
        if st.signaling == SignalingState::Stable {
            st.stable_remote = st.remote_description;
        }
        st.signaling = next;
        st.remote_description = true;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut st = self.inner.lock().unwrap();
        match st.signaling {
            SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer => {}
            other => return Err(MeshError::invalid_state("rollback", other)),
        }
        Self::log(&mut st, "rollback");
        if st.signaling == SignalingState::HaveRemoteOffer {
            st.remote_description = st.stable_remote;
        }
        st.signaling = SignalingState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut st = self.inner.lock().unwrap();
        if !st.remote_description {
            return Err(MeshError::invalid_state("add_ice_candidate", st.signaling));
        }
        if st.rejected.contains(&candidate.candidate) {
            return Err(MeshError::Connection("candidate rejected".into()));
        }
        Self::log(&mut st, "add_candidate");
        st.candidates.push(candidate);
        Ok(())
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        self.inner.lock().unwrap().senders.clone()
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let raise = {
            let mut st = self.inner.lock().unwrap();
            if st.signaling == SignalingState::Closed {
                return Err(MeshError::invalid_state("add_track", st.signaling));
            }
            let index = st.senders.len();
            st.senders.push(SenderInfo {
                index,
                kind: track.kind(),
                track_id: Some(track.id().to_string()),
                direction: Direction::SendRecv,
            });
            Self::log(&mut st, format!("add_track:{}", track.id()));
            Self::raise_negotiation(&mut st)
        };
        if raise {
            self.sink.emit(ConnectionEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn replace_track(&self, sender: usize, track: Option<&LocalTrack>) -> Result<()> {
        let mut st = self.inner.lock().unwrap();
        let Some(slot) = st.senders.get_mut(sender) else {
            return Err(MeshError::Connection(format!("no sender at {sender}")));
        };
        slot.track_id = track.map(|t| t.id().to_string());
        Self::log(&mut st, format!("replace_track:{sender}"));
        Ok(())
    }

    async fn set_direction(&self, sender: usize, direction: Direction) -> Result<()> {
        let changed = {
            let mut st = self.inner.lock().unwrap();
            let Some(slot) = st.senders.get_mut(sender) else {
                return Err(MeshError::Connection(format!("no sender at {sender}")));
            };
            let changed = slot.direction != direction;
            slot.direction = direction;
            Self::log(&mut st, format!("set_direction:{sender}"));
            changed && Self::raise_negotiation(&mut st)
        };
        if changed {
            self.sink.emit(ConnectionEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut st = self.inner.lock().unwrap();
        Self::log(&mut st, "close");
        st.signaling = SignalingState::Closed;
        st.connection = ConnectionState::Closed;
        Ok(())
    }
}

// ─── FakeFactory ────────────────────────────────────────────────────────────

/// Hands out [`FakeConnection`]s and keeps every one it built.
#[derive(Default)]
pub struct FakeFactory {
    built: Mutex<Vec<(String, Arc<FakeConnection>)>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.built.lock().unwrap().len()
    }

    /// Most recent connection built for `peer_id`.
    pub fn connection(&self, peer_id: &str) -> Option<Arc<FakeConnection>> {
        self.built
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == peer_id)
            .map(|(_, c)| Arc::clone(c))
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn create(&self, events: ConnectionEventSink) -> Result<Arc<dyn MediaConnection>> {
        let peer_id = events.peer_id().to_string();
        let conn = FakeConnection::new(events);
        self.built.lock().unwrap().push((peer_id, Arc::clone(&conn)));
        Ok(conn)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rollback_of_first_remote_offer_forgets_it() {
        let (conn, _rx) = FakeConnection::detached();
        conn.set_remote_description(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();
        assert!(conn.has_remote_description().await);

        conn.rollback().await.unwrap();
        assert_eq!(conn.signaling_state(), SignalingState::Stable);
        assert!(!conn.has_remote_description().await);
        assert!(conn.add_ice_candidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mline_index: Some(0),
            sdp_mid: None,
        })
        .await
        .unwrap_err()
        .is_invalid_state());
    }

    #[tokio::test]
    async fn rollback_of_renegotiation_keeps_earlier_remote() {
        let (conn, _rx) = FakeConnection::detached();
        conn.create_offer().await.unwrap();
        conn.set_remote_description(SessionDescription::answer("v=0 answer"))
            .await
            .unwrap();

        conn.set_remote_description(SessionDescription::offer("v=0 again"))
            .await
            .unwrap();
        conn.rollback().await.unwrap();
        assert!(conn.has_remote_description().await);
    }

    #[tokio::test]
    async fn rollback_of_local_offer_leaves_remote_alone() {
        let (conn, _rx) = FakeConnection::detached();
        conn.create_offer().await.unwrap();
        conn.rollback().await.unwrap();
        assert_eq!(conn.signaling_state(), SignalingState::Stable);
        assert!(!conn.has_remote_description().await);
    }
}
