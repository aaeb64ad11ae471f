//! Meeting lifecycle: one actor task per meeting session.
//!
//! The actor owns the roster, every PeerLink, the candidate buffer and the
//! local media.  Signaling input, connection events and caller commands are
//! all handled on that one task, so handlers for the same peer never
//! interleave and screen-share toggles are serialized by construction.
//!
//! `idle → connecting → connected → {error | closed}`

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::candidates::CandidateDisposition;
use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionFactory, PeerSignal};
use crate::error::{MeshError, Result};
use crate::events::{EventBus, MeetingEvent};
use crate::media::{LocalMediaState, MediaDevices, ShareOutcome, TrackManager};
use crate::negotiation::{should_initiate_offer, PeerContext};
use crate::peer::{ConnectionSummary, PeerConnectionRegistry, PeerSnapshot};
use crate::protocol::{ClientMessage, IceCandidate, ServerMessage};
use crate::roster::{Participant, Roster};
use crate::signaling::{SignalingChannel, SignalingInput, SignalingSender};

// ─── Meeting state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingState {
    Idle,
    Connecting,
    Connected,
    Error,
    Closed,
}

impl MeetingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Closed)
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct MeetingSnapshot {
    pub room_id: String,
    pub state: MeetingState,
    pub own_id: Option<String>,
    pub participants: Vec<Participant>,
    pub peers: Vec<PeerSnapshot>,
    pub connections: ConnectionSummary,
    pub local_media: LocalMediaState,
    pub pending_candidates: usize,
}

// ─── Commands ───────────────────────────────────────────────────────────────

enum Command {
    ToggleScreenShare(oneshot::Sender<Result<bool>>),
    SetMicrophone(bool, oneshot::Sender<Result<bool>>),
    SetCamera(bool, oneshot::Sender<Result<bool>>),
    Snapshot(oneshot::Sender<MeetingSnapshot>),
    Leave(oneshot::Sender<()>),
}

enum Internal {
    /// The capture with this stream id ended on its own.
    ScreenShareEnded(String),
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Caller-side surface of a running session.  Cheap to clone.
#[derive(Clone)]
pub struct MeetingHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<MeetingState>,
    events: EventBus,
}

impl MeetingHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| MeshError::SessionClosed)?;
        rx.await.map_err(|_| MeshError::SessionClosed)
    }

    /// Start sharing if not sharing, stop otherwise.  Returns whether the
    /// screen is shared afterwards.
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        self.request(Command::ToggleScreenShare).await?
    }

    /// Returns `false` if there is no microphone to toggle.
    pub async fn set_microphone(&self, enabled: bool) -> Result<bool> {
        self.request(|tx| Command::SetMicrophone(enabled, tx)).await?
    }

    /// Returns `false` if there is no camera to toggle.
    pub async fn set_camera(&self, enabled: bool) -> Result<bool> {
        self.request(|tx| Command::SetCamera(enabled, tx)).await?
    }

    pub async fn snapshot(&self) -> Result<MeetingSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Leave the meeting and tear everything down.  Leaving a session that
    /// is already gone is not an error.
    pub async fn leave(&self) -> Result<()> {
        match self.request(Command::Leave).await {
            Ok(()) | Err(MeshError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn state(&self) -> MeetingState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MeetingState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `done`, returning it.  Returns the
    /// last known state if the session goes away first.
    pub async fn wait_for(&self, done: impl Fn(MeetingState) -> bool) -> MeetingState {
        let mut rx = self.state.clone();
        loop {
            let current = *rx.borrow_and_update();
            if done(current) {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeetingEvent> {
        self.events.subscribe()
    }
}

/// Open the relay socket for `config` and start a session on it.
pub async fn join(
    config: &Config,
    factory: Arc<dyn ConnectionFactory>,
    devices: Arc<dyn MediaDevices>,
    events: EventBus,
) -> Result<(MeetingHandle, JoinHandle<()>)> {
    let channel =
        SignalingChannel::connect(&config.signaling_url, &config.room_id, &config.token).await?;
    let (session, handle) =
        MeetingSession::new(&config.room_id, channel.sender(), factory, devices, events);
    let task = tokio::spawn(session.run(channel));
    Ok((handle, task))
}

// ─── Session actor ──────────────────────────────────────────────────────────

pub struct MeetingSession {
    room_id: String,
    own_id: Option<String>,
    state: watch::Sender<MeetingState>,
    roster: Roster,
    registry: PeerConnectionRegistry,
    tracks: TrackManager,
    signaling: SignalingSender,
    events: EventBus,
    peer_rx: mpsc::UnboundedReceiver<PeerSignal>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    screen_watch: Option<JoinHandle<()>>,
}

impl MeetingSession {
    pub fn new(
        room_id: &str,
        signaling: SignalingSender,
        factory: Arc<dyn ConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        events: EventBus,
    ) -> (Self, MeetingHandle) {
        let (state_tx, state_rx) = watch::channel(MeetingState::Idle);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let session = Self {
            room_id: room_id.to_string(),
            own_id: None,
            state: state_tx,
            roster: Roster::new(),
            registry: PeerConnectionRegistry::new(factory, peer_tx),
            tracks: TrackManager::new(devices),
            signaling,
            events: events.clone(),
            peer_rx,
            commands: cmd_rx,
            internal_tx,
            internal_rx,
            screen_watch: None,
        };
        let handle = MeetingHandle {
            commands: cmd_tx,
            state: state_rx,
            events,
        };
        (session, handle)
    }

    /// Drive the session until it is left (or every handle is dropped).
    pub async fn run(mut self, mut channel: SignalingChannel) {
        self.set_state(MeetingState::Connecting, None);

        match self.tracks.acquire().await {
            Ok(_) => self.emit_local_media(),
            Err(e) => {
                warn!(room_id = %self.room_id, "joining without local media: {e}");
                self.events
                    .emit(MeetingEvent::error(&self.room_id, e.code(), &e.to_string()));
            }
        }

        let mut socket_open = true;
        loop {
            tokio::select! {
                biased;
                input = channel.recv(), if socket_open => {
                    let input = input.unwrap_or(SignalingInput::Closed(None));
                    if matches!(input, SignalingInput::Closed(_)) {
                        socket_open = false;
                    }
                    self.on_signaling(input).await;
                }
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal).await,
                Some(signal) = self.peer_rx.recv() => self.on_peer_signal(signal).await,
                command = self.commands.recv() => match command {
                    Some(Command::Leave(done)) => {
                        self.leave().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.leave().await;
                        break;
                    }
                },
            }
        }

        channel.shutdown().await;
        debug!(room_id = %self.room_id, "session task finished");
    }

    fn current_state(&self) -> MeetingState {
        *self.state.borrow()
    }

    fn set_state(&self, state: MeetingState, reason: Option<String>) {
        let previous = self.state.send_replace(state);
        if previous == state {
            return;
        }
        info!(room_id = %self.room_id, from = ?previous, to = ?state, "meeting state changed");
        self.events
            .emit(MeetingEvent::state_changed(&self.room_id, state, reason));
    }

    fn emit_local_media(&self) {
        self.events
            .emit(MeetingEvent::local_media(&self.room_id, self.tracks.state()));
    }

    /// Log and publish a non-fatal per-peer failure.
    fn report(&self, peer_id: &str, err: &MeshError) {
        warn!(peer_id = %peer_id, code = err.code(), "peer operation failed: {err}");
        self.events.emit(MeetingEvent::error(
            &self.room_id,
            err.code(),
            &format!("{peer_id}: {err}"),
        ));
    }

    // ── Signaling ───────────────────────────────────────────────────────

    async fn on_signaling(&mut self, input: SignalingInput) {
        let message = match input {
            SignalingInput::Message(message) => message,
            SignalingInput::Closed(reason) => {
                if !self.current_state().is_terminal() {
                    let reason = reason.unwrap_or_else(|| "signaling socket closed".into());
                    self.fail("signaling_closed", reason).await;
                }
                return;
            }
        };

        if self.current_state().is_terminal() {
            debug!(kind = message.kind(), "signaling message after session end ignored");
            return;
        }

        match message {
            ServerMessage::Joined {
                participant_id,
                participants,
            } => self.on_joined(participant_id, participants).await,
            ServerMessage::PeerJoined { participant } => self.on_peer_joined(participant).await,
            ServerMessage::PeerLeft { participant_id } => self.on_peer_left(&participant_id).await,
            ServerMessage::Offer { from, sdp } => self.on_offer(&from, sdp).await,
            ServerMessage::Answer { from, sdp } => self.on_answer(&from, sdp).await,
            ServerMessage::Candidate { from, candidate } => {
                self.on_remote_candidate(&from, candidate).await
            }
            ServerMessage::RoomClosed { reason } => self.fail("room_closed", reason).await,
            ServerMessage::Error { code, message } => {
                let code = if code.is_empty() { "relay_error".to_string() } else { code };
                self.fail(&code, message).await
            }
            ServerMessage::Unknown => debug!("unknown signaling message ignored"),
        }
    }

    async fn on_joined(&mut self, own_id: String, participants: Vec<Participant>) {
        info!(room_id = %self.room_id, own_id = %own_id, existing = participants.len(), "joined meeting");
        self.roster.reset(participants, &own_id);
        self.own_id = Some(own_id.clone());
        self.set_state(MeetingState::Connected, None);

        for participant in self.roster.participants() {
            self.events.emit(MeetingEvent::participant_joined(
                &self.room_id,
                &participant.id,
                &participant.display_name,
            ));
            if should_initiate_offer(&own_id, &participant.id) {
                self.initiate(&participant.id).await;
            }
        }
    }

    async fn on_peer_joined(&mut self, participant: Participant) {
        let Some(own_id) = self.own_id.clone() else {
            self.roster.upsert(participant);
            return;
        };
        if participant.id == own_id {
            return;
        }

        let peer_id = participant.id.clone();
        let display_name = participant.display_name.clone();
        if self.roster.upsert(participant) {
            info!(peer_id = %peer_id, "participant joined");
            self.events
                .emit(MeetingEvent::participant_joined(&self.room_id, &peer_id, &display_name));
        }
        if should_initiate_offer(&own_id, &peer_id) {
            self.initiate(&peer_id).await;
        }
    }

    async fn on_peer_left(&mut self, peer_id: &str) {
        let known = self.roster.remove(peer_id).is_some();
        let closed = self.registry.close(peer_id).await;
        if known || closed {
            info!(peer_id = %peer_id, "participant left");
            self.events
                .emit(MeetingEvent::participant_left(&self.room_id, peer_id));
        }
    }

    /// Signals are only accepted from participants currently in the roster;
    /// anything else is left over from someone who already left.
    fn require_member(&self, peer_id: &str) -> Result<()> {
        if self.roster.contains(peer_id) {
            Ok(())
        } else {
            Err(MeshError::UnknownPeer(peer_id.to_string()))
        }
    }

    async fn on_offer(&mut self, peer_id: &str, sdp: String) {
        let Some(own_id) = self.own_id.clone() else {
            warn!(peer_id = %peer_id, "offer before joined ignored");
            return;
        };
        if let Err(e) = self.require_member(peer_id) {
            debug!("offer dropped: {e}");
            return;
        }
        if let Err(e) = self.registry.get_or_create(peer_id, &own_id).await {
            self.report(peer_id, &e);
            return;
        }
        let Some((link, candidates)) = self.registry.link_and_candidates(peer_id) else {
            return;
        };
        let conn = Arc::clone(link.conn());
        let mut cx = PeerContext {
            peer_id,
            conn: conn.as_ref(),
            candidates,
            tracks: &self.tracks,
            signaling: &self.signaling,
        };
        let result = link.negotiation.handle_offer(&mut cx, sdp).await;
        if let Err(e) = result {
            self.report(peer_id, &e);
        }
    }

    async fn on_answer(&mut self, peer_id: &str, sdp: String) {
        if let Err(e) = self.require_member(peer_id) {
            debug!("answer dropped: {e}");
            return;
        }
        let Some((link, candidates)) = self.registry.link_and_candidates(peer_id) else {
            debug!(peer_id = %peer_id, "answer for unknown peer discarded");
            return;
        };
        let conn = Arc::clone(link.conn());
        let mut cx = PeerContext {
            peer_id,
            conn: conn.as_ref(),
            candidates,
            tracks: &self.tracks,
            signaling: &self.signaling,
        };
        let result = link.negotiation.handle_answer(&mut cx, sdp).await;
        if let Err(e) = result {
            self.report(peer_id, &e);
        }
    }

    async fn on_remote_candidate(&mut self, peer_id: &str, candidate: IceCandidate) {
        if let Err(e) = self.require_member(peer_id) {
            debug!("candidate dropped: {e}");
            return;
        }
        let link = self.registry.get(peer_id);
        let ignoring = link.is_some_and(|l| l.negotiation.is_ignoring_offer());
        let conn = link.map(|l| Arc::clone(l.conn()));

        let disposition = self
            .registry
            .candidates_mut()
            .enqueue(peer_id, candidate, conn.as_deref())
            .await;
        if let CandidateDisposition::Rejected(reason) = disposition {
            if ignoring {
                debug!(peer_id = %peer_id, "candidate for ignored offer rejected: {reason}");
            } else {
                warn!(peer_id = %peer_id, "remote candidate rejected: {reason}");
            }
        }
    }

    /// Build the link to `peer_id` as the offering side and put our tracks
    /// on it.  Attaching tracks raises negotiation-needed, which sends the
    /// offer; with nothing to attach the offer is sent directly.  A link
    /// that already exists is only topped up with missing tracks.
    async fn initiate(&mut self, peer_id: &str) {
        let Some(own_id) = self.own_id.clone() else {
            return;
        };
        let existed = self.registry.contains(peer_id);
        if let Err(e) = self.registry.get_or_create(peer_id, &own_id).await {
            self.report(peer_id, &e);
            return;
        }
        let Some((link, candidates)) = self.registry.link_and_candidates(peer_id) else {
            return;
        };
        let conn = Arc::clone(link.conn());

        let attached = match self.tracks.attach_to_connection(conn.as_ref()).await {
            Ok(n) => n,
            Err(e) => {
                warn!(peer_id = %peer_id, "attaching local tracks failed: {e}");
                0
            }
        };
        if attached > 0 || existed {
            return;
        }

        let mut cx = PeerContext {
            peer_id,
            conn: conn.as_ref(),
            candidates,
            tracks: &self.tracks,
            signaling: &self.signaling,
        };
        let result = link.negotiation.negotiate(&mut cx).await;
        if let Err(e) = result {
            self.report(peer_id, &e);
        }
    }

    async fn negotiate_peer(&mut self, peer_id: &str) {
        let Some((link, candidates)) = self.registry.link_and_candidates(peer_id) else {
            return;
        };
        let conn = Arc::clone(link.conn());
        let mut cx = PeerContext {
            peer_id,
            conn: conn.as_ref(),
            candidates,
            tracks: &self.tracks,
            signaling: &self.signaling,
        };
        let result = link.negotiation.negotiate(&mut cx).await;
        if let Err(e) = result {
            self.report(peer_id, &e);
        }
    }

    // ── Connection events ───────────────────────────────────────────────

    async fn on_peer_signal(&mut self, signal: PeerSignal) {
        let PeerSignal {
            peer_id,
            link_id,
            event,
        } = signal;
        if !self.registry.is_current(&peer_id, link_id) {
            debug!(peer_id = %peer_id, link_id, "event from closed connection dropped");
            return;
        }
        if self.current_state().is_terminal() {
            return;
        }

        match event {
            ConnectionEvent::IceCandidate(candidate) => {
                let message = ClientMessage::Candidate {
                    to: peer_id.clone(),
                    candidate,
                };
                if let Err(e) = self.signaling.send(message) {
                    debug!(peer_id = %peer_id, "local candidate not sent: {e}");
                }
            }
            ConnectionEvent::StateChanged(state) => {
                let Some(link) = self.registry.get_mut(&peer_id) else {
                    return;
                };
                if link.set_connection_state(state) {
                    info!(peer_id = %peer_id, state = %state, "peer connection state");
                    self.events
                        .emit(MeetingEvent::connection_state(&self.room_id, &peer_id, state));
                }
            }
            ConnectionEvent::Track(track) => {
                let Some(link) = self.registry.get_mut(&peer_id) else {
                    return;
                };
                if link.on_remote_track(track.clone()) {
                    debug!(peer_id = %peer_id, track_id = %track.id, kind = %track.kind, "remote track");
                    self.events
                        .emit(MeetingEvent::remote_track(&self.room_id, &peer_id, &track));
                }
            }
            ConnectionEvent::NegotiationNeeded => self.negotiate_peer(&peer_id).await,
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::ToggleScreenShare(reply) => {
                let result = self.toggle_screen_share().await;
                let _ = reply.send(result);
            }
            Command::SetMicrophone(enabled, reply) => {
                let result = self.guard_open().map(|()| self.tracks.set_microphone(enabled));
                if matches!(result, Ok(true)) {
                    self.emit_local_media();
                }
                let _ = reply.send(result);
            }
            Command::SetCamera(enabled, reply) => {
                let result = self.guard_open().map(|()| self.tracks.set_camera(enabled));
                if matches!(result, Ok(true)) {
                    self.emit_local_media();
                }
                let _ = reply.send(result);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop.
            Command::Leave(_) => {}
        }
    }

    fn guard_open(&self) -> Result<()> {
        if self.current_state().is_terminal() {
            Err(MeshError::SessionClosed)
        } else {
            Ok(())
        }
    }

    async fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ScreenShareEnded(stream_id) => {
                let current = self.tracks.screen_stream().map(|s| s.id.clone());
                if current.as_deref() == Some(stream_id.as_str()) {
                    info!(stream_id = %stream_id, "screen capture ended by source");
                    self.stop_screen_share().await;
                }
            }
        }
    }

    async fn toggle_screen_share(&mut self) -> Result<bool> {
        self.guard_open()?;
        if self.tracks.state().screen_sharing {
            self.stop_screen_share().await;
            return Ok(false);
        }

        let links = self.registry.connections();
        let outcomes = self.tracks.start_screen_share(&links).await?;
        for (peer_id, outcome) in outcomes {
            if outcome == ShareOutcome::ManualRenegotiation {
                self.negotiate_peer(&peer_id).await;
            }
        }
        self.watch_screen_end();
        self.emit_local_media();
        Ok(true)
    }

    async fn stop_screen_share(&mut self) {
        if let Some(watch) = self.screen_watch.take() {
            watch.abort();
        }
        let links = self.registry.connections();
        if let Err(e) = self.tracks.stop_screen_share(&links).await {
            warn!("stopping screen share failed: {e}");
        }
        self.emit_local_media();
    }

    fn watch_screen_end(&mut self) {
        let Some(stream) = self.tracks.screen_stream() else {
            return;
        };
        let Some(track) = stream.video_track().cloned() else {
            return;
        };
        let stream_id = stream.id.clone();
        let tx = self.internal_tx.clone();
        self.screen_watch = Some(tokio::spawn(async move {
            track.ended().await;
            let _ = tx.send(Internal::ScreenShareEnded(stream_id));
        }));
    }

    fn snapshot(&self) -> MeetingSnapshot {
        MeetingSnapshot {
            room_id: self.room_id.clone(),
            state: self.current_state(),
            own_id: self.own_id.clone(),
            participants: self.roster.participants(),
            peers: self.registry.snapshots(),
            connections: self.registry.summary(),
            local_media: self.tracks.state(),
            pending_candidates: self.registry.candidates().total_pending(),
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Release every link, pending candidate and local capture.
    async fn teardown(&mut self) {
        if let Some(watch) = self.screen_watch.take() {
            watch.abort();
        }
        self.registry.close_all().await;
        self.tracks.stop_all();
        self.roster.clear();
    }

    /// Terminal failure: tear down and stay in `error`.
    async fn fail(&mut self, code: &str, reason: String) {
        warn!(room_id = %self.room_id, code = %code, "meeting ended: {reason}");
        self.events
            .emit(MeetingEvent::error(&self.room_id, code, &reason));
        self.teardown().await;
        self.set_state(MeetingState::Error, Some(reason));
    }

    async fn leave(&mut self) {
        if self.current_state() == MeetingState::Closed {
            return;
        }
        if !self.current_state().is_terminal() {
            let _ = self.signaling.send(ClientMessage::Leave);
        }
        self.teardown().await;
        if self.current_state() != MeetingState::Error {
            self.set_state(MeetingState::Closed, None);
        }
        info!(room_id = %self.room_id, "left meeting");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
