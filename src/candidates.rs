use std::collections::HashMap;
use tracing::{debug, warn};

use crate::connection::MediaConnection;
use crate::protocol::IceCandidate;

// ---------------------------------------------------------------------------
// IceCandidateBuffer
// ---------------------------------------------------------------------------

/// What happened to a candidate handed to [`IceCandidateBuffer::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
    /// The connection rejected it.  Never fatal.
    Rejected(String),
}

/// Remote ICE candidates that arrived before their connection could take
/// them.
///
/// A candidate is applied immediately only when the connection already has a
/// remote description *and* nothing is pending for that peer, so arrival
/// order is always preserved.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    pending: HashMap<String, Vec<IceCandidate>>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply or buffer one remote candidate.  `conn` is `None` when no
    /// connection exists for the peer yet.  A rejection is returned rather
    /// than logged; whether it matters depends on the negotiation state.
    pub async fn enqueue(
        &mut self,
        peer_id: &str,
        candidate: IceCandidate,
        conn: Option<&dyn MediaConnection>,
    ) -> CandidateDisposition {
        let queued = self.pending.get(peer_id).is_some_and(|q| !q.is_empty());
        let ready = match conn {
            Some(conn) if !queued => conn.has_remote_description().await,
            _ => false,
        };

        let Some(conn) = conn.filter(|_| ready) else {
            self.pending
                .entry(peer_id.to_string())
                .or_default()
                .push(candidate);
            debug!(peer_id = %peer_id, "candidate buffered");
            return CandidateDisposition::Buffered;
        };

        match conn.add_ice_candidate(candidate).await {
            Ok(()) => CandidateDisposition::Applied,
            Err(e) => CandidateDisposition::Rejected(e.to_string()),
        }
    }

    /// Apply everything pending for `peer_id` in arrival order and clear the
    /// entry.  Per-candidate failures are logged and skipped.  Returns the
    /// number applied successfully.
    pub async fn flush(&mut self, peer_id: &str, conn: &dyn MediaConnection) -> usize {
        let Some(queue) = self.pending.remove(peer_id) else {
            return 0;
        };
        let total = queue.len();
        let mut applied = 0;
        for candidate in queue {
            match conn.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(peer_id = %peer_id, "buffered candidate rejected: {e}"),
            }
        }
        debug!(peer_id = %peer_id, applied, total, "candidate buffer flushed");
        applied
    }

    /// Drop everything pending for `peer_id`.  Returns how many were dropped.
    pub fn discard(&mut self, peer_id: &str) -> usize {
        self.pending.remove(peer_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending_count(&self, peer_id: &str) -> usize {
        self.pending.get(peer_id).map(Vec::len).unwrap_or(0)
    }

    /// Candidates pending across all peers.
    pub fn total_pending(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.values().all(Vec::is_empty)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
