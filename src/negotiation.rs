//! Perfect Negotiation, one coordinator per peer connection.
//!
//! The state machine itself is synchronous: [`NegotiationCoordinator::apply`]
//! maps an event plus the connection's signaling state to the action to
//! take.  The async drivers (`negotiate`, `handle_offer`, `handle_answer`)
//! carry those actions out against a [`MediaConnection`].

use tracing::{debug, warn};

use crate::candidates::IceCandidateBuffer;
use crate::connection::{MediaConnection, SessionDescription, SignalingState};
use crate::error::Result;
use crate::media::TrackManager;
use crate::protocol::ClientMessage;
use crate::signaling::SignalingSender;

// ─── Tie-breaks ─────────────────────────────────────────────────────────────

/// Collision tie-break: the side whose id sorts greater is polite and yields
/// to the remote offer.  `is_polite(a, b) == !is_polite(b, a)` for `a != b`.
pub fn is_polite(own_id: &str, peer_id: &str) -> bool {
    own_id > peer_id
}

/// Join-time tie-break: of a pre-existing pair, only the side whose id sorts
/// smaller sends the first offer.
pub fn should_initiate_offer(own_id: &str, peer_id: &str) -> bool {
    own_id < peer_id
}

// ─── State machine ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// Local changes need a fresh offer.
    NegotiationNeeded,
    OfferReceived,
    AnswerReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationAction {
    SendOffer,
    /// An offer is already in flight or the connection is mid-exchange; the
    /// request is remembered and retried once stable.
    Defer,
    IgnoreOffer,
    /// Accept the remote offer, rolling back our own first if `rollback`.
    AcceptOffer { rollback: bool },
    ApplyAnswer,
    /// Stale or out-of-order answer.
    DiscardAnswer,
}

/// Outcome of [`NegotiationCoordinator::handle_offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Ignored,
    Answered,
}

#[derive(Debug)]
pub struct NegotiationCoordinator {
    polite: bool,
    making_offer: bool,
    ignore_offer: bool,
    renegotiate_when_stable: bool,
}

impl NegotiationCoordinator {
    pub fn new(polite: bool) -> Self {
        Self {
            polite,
            making_offer: false,
            ignore_offer: false,
            renegotiate_when_stable: false,
        }
    }

    /// Coordinator for the link between `own_id` and `peer_id`.
    pub fn for_pair(own_id: &str, peer_id: &str) -> Self {
        Self::new(is_polite(own_id, peer_id))
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    /// `true` after the last remote offer was ignored as impolite side of a
    /// collision.  Candidate failures are expected in that window.
    pub fn is_ignoring_offer(&self) -> bool {
        self.ignore_offer
    }

    pub fn has_deferred(&self) -> bool {
        self.renegotiate_when_stable
    }

    /// Transition for one event.
    pub fn apply(&mut self, event: NegotiationEvent, state: SignalingState) -> NegotiationAction {
        match event {
            NegotiationEvent::NegotiationNeeded => {
                if self.making_offer || state != SignalingState::Stable {
                    self.renegotiate_when_stable = true;
                    NegotiationAction::Defer
                } else {
                    self.making_offer = true;
                    self.renegotiate_when_stable = false;
                    NegotiationAction::SendOffer
                }
            }
            NegotiationEvent::OfferReceived => {
                let collision = self.making_offer || state != SignalingState::Stable;
                self.ignore_offer = !self.polite && collision;
                if self.ignore_offer {
                    return NegotiationAction::IgnoreOffer;
                }
                if collision {
                    // Our offer is abandoned; whatever it carried is offered
                    // again once this exchange completes.
                    self.making_offer = false;
                    self.renegotiate_when_stable = true;
                }
                NegotiationAction::AcceptOffer { rollback: collision }
            }
            NegotiationEvent::AnswerReceived => {
                if state == SignalingState::HaveLocalOffer {
                    NegotiationAction::ApplyAnswer
                } else {
                    NegotiationAction::DiscardAnswer
                }
            }
        }
    }

    /// The offer attempt started by [`NegotiationAction::SendOffer`] is over,
    /// successfully or not.
    pub fn offer_settled(&mut self) {
        self.making_offer = false;
    }

    /// Consume a deferred renegotiation request if the connection is back in
    /// `stable`.
    pub fn take_deferred(&mut self, state: SignalingState) -> bool {
        if self.renegotiate_when_stable && !self.making_offer && state == SignalingState::Stable {
            self.renegotiate_when_stable = false;
            true
        } else {
            false
        }
    }
}

// ─── Drivers ────────────────────────────────────────────────────────────────

/// Everything a coordinator touches while running an exchange for one peer.
pub struct PeerContext<'a> {
    pub peer_id: &'a str,
    pub conn: &'a dyn MediaConnection,
    pub candidates: &'a mut IceCandidateBuffer,
    pub tracks: &'a TrackManager,
    pub signaling: &'a SignalingSender,
}

impl NegotiationCoordinator {
    /// Produce and send an offer, unless one is already in flight.  Returns
    /// whether an offer went out.
    ///
    /// A wrong-state failure means a collision is being resolved elsewhere
    /// and is swallowed.
    pub async fn negotiate(&mut self, cx: &mut PeerContext<'_>) -> Result<bool> {
        match self.apply(NegotiationEvent::NegotiationNeeded, cx.conn.signaling_state()) {
            NegotiationAction::SendOffer => {}
            _ => {
                debug!(peer_id = %cx.peer_id, "negotiation deferred");
                return Ok(false);
            }
        }

        let sent = async {
            let offer = cx.conn.create_offer().await?;
            cx.signaling.send(ClientMessage::Offer {
                to: cx.peer_id.to_string(),
                sdp: offer.sdp,
            })
        }
        .await;
        self.offer_settled();

        match sent {
            Ok(()) => {
                debug!(peer_id = %cx.peer_id, "offer sent");
                Ok(true)
            }
            Err(e) if e.is_invalid_state() => {
                debug!(peer_id = %cx.peer_id, "offer skipped: {e}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Handle a remote offer: ignore it (impolite side of a collision) or
    /// accept it, then flush candidates, sync outgoing tracks and answer.
    pub async fn handle_offer(&mut self, cx: &mut PeerContext<'_>, sdp: String) -> Result<OfferOutcome> {
        let rollback = match self.apply(NegotiationEvent::OfferReceived, cx.conn.signaling_state()) {
            NegotiationAction::AcceptOffer { rollback } => rollback,
            _ => {
                debug!(peer_id = %cx.peer_id, "colliding offer ignored");
                return Ok(OfferOutcome::Ignored);
            }
        };

        if rollback && cx.conn.signaling_state() != SignalingState::Stable {
            debug!(peer_id = %cx.peer_id, "rolling back local offer");
            cx.conn.rollback().await?;
        }
        cx.conn
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;

        cx.candidates.flush(cx.peer_id, cx.conn).await;
        if let Err(e) = cx.tracks.attach_to_connection(cx.conn).await {
            warn!(peer_id = %cx.peer_id, "outgoing track sync failed: {e}");
        }

        let answer = cx.conn.create_answer().await?;
        cx.signaling.send(ClientMessage::Answer {
            to: cx.peer_id.to_string(),
            sdp: answer.sdp,
        })?;
        debug!(peer_id = %cx.peer_id, "answer sent");

        self.run_deferred(cx).await?;
        Ok(OfferOutcome::Answered)
    }

    /// Apply a remote answer if we are waiting for one.  Returns `false` when
    /// the answer was stale and discarded.
    pub async fn handle_answer(&mut self, cx: &mut PeerContext<'_>, sdp: String) -> Result<bool> {
        let state = cx.conn.signaling_state();
        if self.apply(NegotiationEvent::AnswerReceived, state) != NegotiationAction::ApplyAnswer {
            debug!(peer_id = %cx.peer_id, state = %state, "stale answer discarded");
            return Ok(false);
        }

        cx.conn
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        cx.candidates.flush(cx.peer_id, cx.conn).await;

        self.run_deferred(cx).await?;
        Ok(true)
    }

    async fn run_deferred(&mut self, cx: &mut PeerContext<'_>) -> Result<()> {
        if self.take_deferred(cx.conn.signaling_state()) {
            debug!(peer_id = %cx.peer_id, "running deferred negotiation");
            self.negotiate(cx).await?;
        }
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use crate::media::{DeviceProfile, SyntheticDevices};
    use crate::protocol::IceCandidate;
    use crate::testing::FakeConnection;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Harness {
        conn: Arc<FakeConnection>,
        candidates: IceCandidateBuffer,
        tracks: TrackManager,
        signaling: SignalingSender,
        outbox: mpsc::UnboundedReceiver<ClientMessage>,
    }

    impl Harness {
        fn new() -> Self {
            let (conn, _events) = FakeConnection::detached();
            let (tx, outbox) = mpsc::unbounded_channel();
            Self {
                conn,
                candidates: IceCandidateBuffer::new(),
                tracks: TrackManager::new(Arc::new(SyntheticDevices::new(DeviceProfile::AudioVideo))),
                signaling: SignalingSender::new(tx),
                outbox,
            }
        }

        fn cx(&mut self) -> PeerContext<'_> {
            PeerContext {
                peer_id: "peer",
                conn: self.conn.as_ref(),
                candidates: &mut self.candidates,
                tracks: &self.tracks,
                signaling: &self.signaling,
            }
        }

        fn sent(&mut self) -> Vec<ClientMessage> {
            let mut out = Vec::new();
            while let Ok(m) = self.outbox.try_recv() {
                out.push(m);
            }
            out
        }
    }

    fn kinds(messages: &[ClientMessage]) -> Vec<&'static str> {
        messages
            .iter()
            .map(|m| match m {
                ClientMessage::Offer { .. } => "offer",
                ClientMessage::Answer { .. } => "answer",
                ClientMessage::Candidate { .. } => "candidate",
                ClientMessage::Leave => "leave",
            })
            .collect()
    }

    // --- tie-breaks -------------------------------------------------------

    #[test]
    fn politeness_is_antisymmetric() {
        let ids = ["alice", "bob", "carol", "Bob", "a", "aa", "p-01", "p-10", ""];
        for a in ids {
            for b in ids {
                if a == b {
                    continue;
                }
                assert_ne!(is_polite(a, b), is_polite(b, a), "{a} vs {b}");
                assert_eq!(is_polite(a, b), is_polite(a, b));
            }
        }
    }

    #[test]
    fn exactly_one_side_initiates() {
        assert!(should_initiate_offer("alice", "bob"));
        assert!(!should_initiate_offer("bob", "alice"));
        // The initiator is the impolite side.
        assert!(!is_polite("alice", "bob"));
        assert!(is_polite("bob", "alice"));
    }

    // --- state machine ----------------------------------------------------

    #[test]
    fn negotiation_needed_defers_while_busy() {
        let mut c = NegotiationCoordinator::new(false);
        assert_eq!(
            c.apply(NegotiationEvent::NegotiationNeeded, SignalingState::Stable),
            NegotiationAction::SendOffer
        );
        assert!(c.is_making_offer());
        assert_eq!(
            c.apply(NegotiationEvent::NegotiationNeeded, SignalingState::Stable),
            NegotiationAction::Defer
        );
        c.offer_settled();
        assert!(!c.take_deferred(SignalingState::HaveLocalOffer));
        assert!(c.take_deferred(SignalingState::Stable));
        assert!(!c.take_deferred(SignalingState::Stable));
    }

    #[test]
    fn offer_collision_table() {
        let mut impolite = NegotiationCoordinator::new(false);
        assert_eq!(
            impolite.apply(NegotiationEvent::OfferReceived, SignalingState::HaveLocalOffer),
            NegotiationAction::IgnoreOffer
        );
        assert!(impolite.is_ignoring_offer());
        assert_eq!(
            impolite.apply(NegotiationEvent::OfferReceived, SignalingState::Stable),
            NegotiationAction::AcceptOffer { rollback: false }
        );
        assert!(!impolite.is_ignoring_offer());

        let mut polite = NegotiationCoordinator::new(true);
        assert_eq!(
            polite.apply(NegotiationEvent::OfferReceived, SignalingState::HaveLocalOffer),
            NegotiationAction::AcceptOffer { rollback: true }
        );
        assert!(polite.has_deferred());
    }

    #[test]
    fn answers_only_in_have_local_offer() {
        let mut c = NegotiationCoordinator::new(true);
        for state in [
            SignalingState::Stable,
            SignalingState::HaveRemoteOffer,
            SignalingState::Closed,
        ] {
            assert_eq!(
                c.apply(NegotiationEvent::AnswerReceived, state),
                NegotiationAction::DiscardAnswer
            );
        }
        assert_eq!(
            c.apply(NegotiationEvent::AnswerReceived, SignalingState::HaveLocalOffer),
            NegotiationAction::ApplyAnswer
        );
    }

    // --- drivers ----------------------------------------------------------

    #[tokio::test]
    async fn negotiate_sends_offer_and_clears_flag() {
        let mut h = Harness::new();
        let mut coord = NegotiationCoordinator::new(false);

        assert!(coord.negotiate(&mut h.cx()).await.unwrap());
        assert!(!coord.is_making_offer());
        assert_eq!(h.conn.signaling_state(), SignalingState::HaveLocalOffer);
        let sent = h.sent();
        assert_eq!(kinds(&sent), vec!["offer"]);
        assert_eq!(sent[0].recipient(), Some("peer"));
    }

    #[tokio::test]
    async fn negotiate_swallows_wrong_state() {
        let mut h = Harness::new();
        h.conn.fail_offers_with_invalid_state(true);
        let mut coord = NegotiationCoordinator::new(false);

        assert!(!coord.negotiate(&mut h.cx()).await.unwrap());
        assert!(!coord.is_making_offer());
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn negotiate_reports_other_failures() {
        let (conn, _events) = FakeConnection::detached();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let signaling = SignalingSender::new(tx);
        let tracks = TrackManager::new(Arc::new(SyntheticDevices::new(DeviceProfile::None)));
        let mut candidates = IceCandidateBuffer::new();
        let mut cx = PeerContext {
            peer_id: "peer",
            conn: conn.as_ref(),
            candidates: &mut candidates,
            tracks: &tracks,
            signaling: &signaling,
        };
        let mut coord = NegotiationCoordinator::new(false);

        let err = coord.negotiate(&mut cx).await.unwrap_err();
        assert!(matches!(err, MeshError::SessionClosed));
        assert!(!coord.is_making_offer());
    }

    #[tokio::test]
    async fn polite_collision_rolls_back_and_answers() {
        let mut h = Harness::new();
        let mut coord = NegotiationCoordinator::new(true);

        // Our own offer is out and we are still marked as making one.
        h.conn.create_offer().await.unwrap();
        assert_eq!(
            coord.apply(NegotiationEvent::NegotiationNeeded, SignalingState::Stable),
            NegotiationAction::SendOffer
        );
        h.conn.clear_ops();

        let outcome = coord.handle_offer(&mut h.cx(), "v=0 remote".into()).await.unwrap();
        assert_eq!(outcome, OfferOutcome::Answered);
        assert!(!coord.is_ignoring_offer());

        let ops = h.conn.ops();
        let rollback = ops.iter().position(|o| o == "rollback").unwrap();
        let remote = ops.iter().position(|o| o == "set_remote:offer").unwrap();
        let answer = ops.iter().position(|o| o == "create_answer").unwrap();
        assert!(rollback < remote && remote < answer);

        // The answer goes out first; the abandoned offer is then retried.
        let sent = h.sent();
        assert_eq!(kinds(&sent), vec!["answer", "offer"]);
    }

    #[tokio::test]
    async fn impolite_collision_ignores_and_keeps_own_offer() {
        let mut h = Harness::new();
        let mut coord = NegotiationCoordinator::new(false);
        assert!(coord.negotiate(&mut h.cx()).await.unwrap());
        h.sent();
        h.conn.clear_ops();

        let outcome = coord.handle_offer(&mut h.cx(), "v=0 remote".into()).await.unwrap();
        assert_eq!(outcome, OfferOutcome::Ignored);
        assert!(coord.is_ignoring_offer());
        assert!(h.conn.ops().is_empty(), "connection must be untouched");
        assert!(h.sent().is_empty());
        assert_eq!(h.conn.signaling_state(), SignalingState::HaveLocalOffer);

        // The remote (polite) side answers our offer; it still applies.
        assert!(coord.handle_answer(&mut h.cx(), "v=0 answer".into()).await.unwrap());
        assert_eq!(h.conn.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn offer_without_collision_flushes_then_answers() {
        let mut h = Harness::new();
        h.tracks.acquire().await.unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mline_index: Some(0),
            sdp_mid: None,
        };
        h.candidates.enqueue("peer", candidate.clone(), Some(h.conn.as_ref())).await;

        let mut coord = NegotiationCoordinator::new(true);
        coord.handle_offer(&mut h.cx(), "v=0 remote".into()).await.unwrap();

        assert_eq!(h.conn.applied_candidates(), vec![candidate]);
        assert_eq!(h.candidates.pending_count("peer"), 0);
        assert_eq!(h.conn.sender_count(), 2, "outgoing tracks attached before answering");
        assert!(!h.conn.ops().contains(&"rollback".to_string()));
        assert_eq!(kinds(&h.sent()), vec!["answer"]);
        assert_eq!(h.conn.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn stale_answer_is_discarded() {
        let mut h = Harness::new();
        let mut coord = NegotiationCoordinator::new(true);
        assert!(!coord.handle_answer(&mut h.cx(), "v=0 late".into()).await.unwrap());
        assert!(h.conn.ops().is_empty());
    }

    #[tokio::test]
    async fn deferred_request_runs_after_answer() {
        let mut h = Harness::new();
        let mut coord = NegotiationCoordinator::new(false);
        assert!(coord.negotiate(&mut h.cx()).await.unwrap());
        // A second request while our offer is outstanding is deferred.
        assert!(!coord.negotiate(&mut h.cx()).await.unwrap());
        assert!(coord.has_deferred());
        h.sent();

        coord.handle_answer(&mut h.cx(), "v=0 answer".into()).await.unwrap();
        assert_eq!(kinds(&h.sent()), vec!["offer"]);
        assert!(!coord.has_deferred());
    }
}
