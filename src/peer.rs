use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::candidates::IceCandidateBuffer;
use crate::connection::{
    ConnectionEventSink, ConnectionFactory, ConnectionState, MediaConnection, PeerSignal,
    RemoteTrack,
};
use crate::error::Result;
use crate::negotiation::NegotiationCoordinator;

// ---------------------------------------------------------------------------
// RemoteStream
// ---------------------------------------------------------------------------

/// Tracks received from one peer.  Written only by that connection's
/// track-arrival events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Record an arriving track.  Returns `false` if it was already known.
    pub fn add(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }
}

// ---------------------------------------------------------------------------
// PeerLink
// ---------------------------------------------------------------------------

/// Everything held for one remote participant.
pub struct PeerLink {
    peer_id: String,
    /// Generation of this link.  Events carrying another value belong to a
    /// connection that has since been closed.
    link_id: u64,
    conn: Arc<dyn MediaConnection>,
    pub negotiation: NegotiationCoordinator,
    connection_state: ConnectionState,
    remote_stream: RemoteStream,
}

impl PeerLink {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn conn(&self) -> &Arc<dyn MediaConnection> {
        &self.conn
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    /// Returns `true` if the state actually changed.
    pub fn set_connection_state(&mut self, state: ConnectionState) -> bool {
        let changed = self.connection_state != state;
        self.connection_state = state;
        changed
    }

    pub fn remote_stream(&self) -> &RemoteStream {
        &self.remote_stream
    }

    pub fn on_remote_track(&mut self, track: RemoteTrack) -> bool {
        self.remote_stream.add(track)
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.peer_id.clone(),
            polite: self.negotiation.is_polite(),
            connection_state: self.connection_state,
            remote_tracks: self.remote_stream.tracks.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub polite: bool,
    pub connection_state: ConnectionState,
    pub remote_tracks: usize,
}

/// Number of links in each connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub total: usize,
    pub new: usize,
    pub connecting: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub failed: usize,
    pub closed: usize,
}

impl ConnectionSummary {
    fn count(&mut self, state: ConnectionState) {
        self.total += 1;
        match state {
            ConnectionState::New => self.new += 1,
            ConnectionState::Connecting => self.connecting += 1,
            ConnectionState::Connected => self.connected += 1,
            ConnectionState::Disconnected => self.disconnected += 1,
            ConnectionState::Failed => self.failed += 1,
            ConnectionState::Closed => self.closed += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// PeerConnectionRegistry
// ---------------------------------------------------------------------------

/// Owner of every PeerLink (at most one per peer id) and of the candidates
/// waiting for them.
pub struct PeerConnectionRegistry {
    factory: Arc<dyn ConnectionFactory>,
    events_tx: mpsc::UnboundedSender<PeerSignal>,
    links: HashMap<String, PeerLink>,
    candidates: IceCandidateBuffer,
    next_link_id: u64,
}

impl PeerConnectionRegistry {
    /// Connections built here report through `events_tx`.
    pub fn new(factory: Arc<dyn ConnectionFactory>, events_tx: mpsc::UnboundedSender<PeerSignal>) -> Self {
        Self {
            factory,
            events_tx,
            links: HashMap::new(),
            candidates: IceCandidateBuffer::new(),
            next_link_id: 1,
        }
    }

    /// Return the link for `peer_id`, building it first if absent.
    ///
    /// A new connection is wired to the shared event channel (candidates,
    /// state changes, remote tracks, negotiation-needed) and starts with an
    /// empty negotiation state whose politeness derives from the two ids.
    pub async fn get_or_create(&mut self, peer_id: &str, own_id: &str) -> Result<&mut PeerLink> {
        match self.links.entry(peer_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let link_id = self.next_link_id;
                self.next_link_id += 1;

                let sink = ConnectionEventSink::new(peer_id, link_id, self.events_tx.clone());
                let conn = self.factory.create(sink).await?;
                let negotiation = NegotiationCoordinator::for_pair(own_id, peer_id);
                info!(
                    peer_id = %peer_id,
                    link_id,
                    polite = negotiation.is_polite(),
                    "peer connection created"
                );

                Ok(entry.insert(PeerLink {
                    peer_id: peer_id.to_string(),
                    link_id,
                    connection_state: conn.connection_state(),
                    conn,
                    negotiation,
                    remote_stream: RemoteStream::default(),
                }))
            }
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerLink> {
        self.links.get_mut(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    /// Whether `link_id` is still the live generation for `peer_id`.
    pub fn is_current(&self, peer_id: &str, link_id: u64) -> bool {
        self.links
            .get(peer_id)
            .is_some_and(|link| link.link_id == link_id)
    }

    /// The link together with the candidate buffer, borrowed separately.
    pub fn link_and_candidates(
        &mut self,
        peer_id: &str,
    ) -> Option<(&mut PeerLink, &mut IceCandidateBuffer)> {
        let link = self.links.get_mut(peer_id)?;
        Some((link, &mut self.candidates))
    }

    pub fn candidates_mut(&mut self) -> &mut IceCandidateBuffer {
        &mut self.candidates
    }

    pub fn candidates(&self) -> &IceCandidateBuffer {
        &self.candidates
    }

    /// Close the connection for `peer_id` and drop its negotiation state and
    /// pending candidates.  Returns `false` if there was no link.
    pub async fn close(&mut self, peer_id: &str) -> bool {
        let dropped = self.candidates.discard(peer_id);
        let Some(link) = self.links.remove(peer_id) else {
            if dropped > 0 {
                debug!(peer_id = %peer_id, dropped, "pending candidates discarded");
            }
            return false;
        };
        if let Err(e) = link.conn.close().await {
            warn!(peer_id = %peer_id, "connection close failed: {e}");
        }
        info!(peer_id = %peer_id, link_id = link.link_id, dropped, "peer connection closed");
        true
    }

    /// Close every link and forget every pending candidate.
    pub async fn close_all(&mut self) {
        let ids: Vec<String> = self.links.keys().cloned().collect();
        for id in ids {
            self.close(&id).await;
        }
        self.candidates.clear();
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Connection handle of every link, ordered by peer id.
    pub fn connections(&self) -> Vec<(String, Arc<dyn MediaConnection>)> {
        let mut conns: Vec<(String, Arc<dyn MediaConnection>)> = self
            .links
            .values()
            .map(|l| (l.peer_id.clone(), Arc::clone(&l.conn)))
            .collect();
        conns.sort_by(|a, b| a.0.cmp(&b.0));
        conns
    }

    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self.links.values().map(PeerLink::snapshot).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn summary(&self) -> ConnectionSummary {
        let mut summary = ConnectionSummary::default();
        for link in self.links.values() {
            summary.count(link.connection_state);
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEvent, TrackKind};
    use crate::protocol::IceCandidate;
    use crate::testing::FakeFactory;

    fn registry() -> (
        PeerConnectionRegistry,
        Arc<FakeFactory>,
        mpsc::UnboundedReceiver<PeerSignal>,
    ) {
        let factory = FakeFactory::new();
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerConnectionRegistry::new(factory.clone(), tx), factory, rx)
    }

    fn cand(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mline_index: Some(0),
            sdp_mid: None,
        }
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (mut reg, factory, _rx) = registry();

        let first = reg.get_or_create("alice", "bob").await.unwrap();
        let first_id = first.link_id();
        let first_conn = Arc::clone(first.conn());
        let second = reg.get_or_create("alice", "bob").await.unwrap();

        assert_eq!(second.link_id(), first_id);
        assert!(Arc::ptr_eq(second.conn(), &first_conn));
        assert_eq!(factory.created(), 1);
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn politeness_follows_ids() {
        let (mut reg, _, _rx) = registry();
        assert!(reg.get_or_create("alice", "bob").await.unwrap().negotiation.is_polite());
        assert!(!reg.get_or_create("carol", "bob").await.unwrap().negotiation.is_polite());
    }

    #[tokio::test]
    async fn events_are_tagged_with_generation() {
        let (mut reg, factory, mut rx) = registry();
        let link_id = reg.get_or_create("alice", "bob").await.unwrap().link_id();

        let conn = factory.connection("alice").unwrap();
        conn.fire(ConnectionEvent::StateChanged(ConnectionState::Connecting));
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.peer_id, "alice");
        assert_eq!(signal.link_id, link_id);
        assert!(reg.is_current("alice", link_id));
    }

    #[tokio::test]
    async fn close_tears_down_link_and_candidates() {
        let (mut reg, factory, _rx) = registry();
        reg.get_or_create("alice", "bob").await.unwrap();
        let old_id = reg.get("alice").unwrap().link_id();
        reg.candidates_mut().enqueue("alice", cand(1), None).await;
        reg.candidates_mut().enqueue("alice", cand(2), None).await;

        assert!(reg.close("alice").await);
        assert!(!reg.contains("alice"));
        assert_eq!(reg.candidates().pending_count("alice"), 0);
        assert!(factory.connection("alice").unwrap().is_closed());
        assert!(!reg.is_current("alice", old_id));

        assert!(!reg.close("alice").await);

        // A returning participant gets a fresh generation.
        let new_id = reg.get_or_create("alice", "bob").await.unwrap().link_id();
        assert_ne!(new_id, old_id);
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn close_all_empties_everything() {
        let (mut reg, factory, _rx) = registry();
        for id in ["alice", "carol", "dave"] {
            reg.get_or_create(id, "bob").await.unwrap();
        }
        reg.candidates_mut().enqueue("erin", cand(1), None).await;

        reg.close_all().await;
        assert!(reg.is_empty());
        assert!(reg.candidates().is_empty());
        for id in ["alice", "carol", "dave"] {
            assert!(factory.connection(id).unwrap().is_closed());
        }
    }

    #[tokio::test]
    async fn summary_counts_states() {
        let (mut reg, _, _rx) = registry();
        for id in ["alice", "carol", "dave"] {
            reg.get_or_create(id, "bob").await.unwrap();
        }
        reg.get_mut("alice").unwrap().set_connection_state(ConnectionState::Connected);
        reg.get_mut("carol").unwrap().set_connection_state(ConnectionState::Failed);

        let summary = reg.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.connected, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.new, 1);
        assert_eq!(reg.peer_ids(), vec!["alice", "carol", "dave"]);
    }

    #[test]
    fn remote_stream_dedupes_by_id() {
        let mut stream = RemoteStream::default();
        let track = RemoteTrack {
            id: "a1".into(),
            kind: TrackKind::Audio,
            stream_id: "s".into(),
        };
        assert!(stream.add(track.clone()));
        assert!(!stream.add(track));
        assert_eq!(stream.tracks.len(), 1);
    }
}
