//! Local capture and the outgoing-track lifecycle (TrackManager).
//!
//! The camera/microphone stream and the optional screen-capture stream are
//! owned here.  Exactly one video source is ever sent: the screen track while
//! sharing, the camera track otherwise.  Swapping between the two is done by
//! replacing the sender's track in place wherever possible so that no
//! connection is torn down and no sender is duplicated.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::connection::{Direction, MediaConnection, TrackKind};
use crate::error::{MeshError, Result};

// ---------------------------------------------------------------------------
// TrackSource: which capture device a track came from
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

// ---------------------------------------------------------------------------
// LocalTrack
// ---------------------------------------------------------------------------

/// One locally captured track.
///
/// Cheap to clone; every clone refers to the same capture.  Identity is the
/// track id, never the kind.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

struct LocalTrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    ended: AtomicBool,
    ended_notify: Notify,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(
        kind: TrackKind,
        source: TrackSource,
        id: impl Into<String>,
        rtp: Arc<TrackLocalStaticSample>,
    ) -> Self {
        LocalTrack {
            inner: Arc::new(LocalTrackInner {
                id: id.into(),
                kind,
                source,
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
                ended_notify: Notify::new(),
                rtp,
            }),
        }
    }

    /// Build a track backed by a sample track with the default codec for its
    /// kind (Opus for audio, VP8 for video).
    pub fn with_default_codec(
        kind: TrackKind,
        source: TrackSource,
        id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            id.clone(),
            stream_id.into(),
        ));
        Self::new(kind, source, id, rtp)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    /// The webrtc-rs track handed to senders.
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtp)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Mute / unmute.  A disabled track keeps its sender.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_live(&self) -> bool {
        !self.inner.ended.load(Ordering::SeqCst)
    }

    /// Stop the capture for good.  Idempotent.
    pub fn stop(&self) {
        if !self.inner.ended.swap(true, Ordering::SeqCst) {
            self.inner.ended_notify.notify_waiters();
        }
    }

    /// Resolves once the track has ended, whether stopped by us or by the
    /// capture source itself (e.g. the OS "stop sharing" control).
    pub async fn ended(&self) {
        loop {
            let notified = self.inner.ended_notify.notified();
            if !self.is_live() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// LocalStream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|t| t.id() == track_id)
    }

    /// Stop every track of the stream.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// Capture devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// Access to the local capture hardware.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(&self, constraints: MediaConstraints) -> Result<LocalStream>;

    async fn display_media(&self) -> Result<LocalStream>;
}

/// Which capture devices a [`SyntheticDevices`] pretends to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProfile {
    AudioVideo,
    Audio,
    None,
}

impl std::str::FromStr for DeviceProfile {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "audio_video" | "av" => Ok(Self::AudioVideo),
            "audio" => Ok(Self::Audio),
            "none" => Ok(Self::None),
            other => Err(MeshError::Config(format!("unknown device profile '{other}'"))),
        }
    }
}

/// Devices that produce sample tracks without touching real hardware.
///
/// Used by the headless participant binary and by tests.
pub struct SyntheticDevices {
    profile: DeviceProfile,
    display_available: bool,
    user_media_calls: AtomicUsize,
    display_media_calls: AtomicUsize,
    last_display: Mutex<Option<LocalStream>>,
}

impl SyntheticDevices {
    pub fn new(profile: DeviceProfile) -> Self {
        SyntheticDevices {
            profile,
            display_available: true,
            user_media_calls: AtomicUsize::new(0),
            display_media_calls: AtomicUsize::new(0),
            last_display: Mutex::new(None),
        }
    }

    pub fn without_display(mut self) -> Self {
        self.display_available = false;
        self
    }

    pub fn user_media_calls(&self) -> usize {
        self.user_media_calls.load(Ordering::Relaxed)
    }

    pub fn display_media_calls(&self) -> usize {
        self.display_media_calls.load(Ordering::Relaxed)
    }

    /// The most recent display capture handed out.  Stopping its tracks
    /// acts like the OS "stop sharing" control.
    pub async fn last_display_stream(&self) -> Option<LocalStream> {
        self.last_display.lock().await.clone()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn user_media(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        self.user_media_calls.fetch_add(1, Ordering::Relaxed);

        let has_audio = self.profile != DeviceProfile::None;
        let has_video = self.profile == DeviceProfile::AudioVideo;
        if (constraints.audio && !has_audio) || (constraints.video && !has_video) {
            return Err(MeshError::DeviceUnavailable(format!(
                "requested audio={} video={}, profile={:?}",
                constraints.audio, constraints.video, self.profile
            )));
        }

        let stream_id = format!("local-{}", uuid::Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::with_default_codec(
                TrackKind::Audio,
                TrackSource::Microphone,
                format!("mic-{}", uuid::Uuid::new_v4()),
                stream_id.clone(),
            ));
        }
        if constraints.video {
            tracks.push(LocalTrack::with_default_codec(
                TrackKind::Video,
                TrackSource::Camera,
                format!("cam-{}", uuid::Uuid::new_v4()),
                stream_id.clone(),
            ));
        }
        Ok(LocalStream {
            id: stream_id,
            tracks,
        })
    }

    async fn display_media(&self) -> Result<LocalStream> {
        self.display_media_calls.fetch_add(1, Ordering::Relaxed);
        if !self.display_available {
            return Err(MeshError::DisplayCaptureUnavailable(
                "no display source".into(),
            ));
        }
        let stream_id = format!("screen-{}", uuid::Uuid::new_v4());
        let track = LocalTrack::with_default_codec(
            TrackKind::Video,
            TrackSource::Screen,
            format!("screen-{}", uuid::Uuid::new_v4()),
            stream_id.clone(),
        );
        let stream = LocalStream {
            id: stream_id,
            tracks: vec![track],
        };
        *self.last_display.lock().await = Some(stream.clone());
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// LocalMediaState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaState {
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub screen_sharing: bool,
}

/// How a connection's video sender was switched to the screen track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    /// A live track was swapped in place; no renegotiation.
    ReplacedInPlace,
    /// An idle receive-only/inactive sender was turned to send-receive; the
    /// connection signals negotiation-needed by itself.
    DirectionFlipped,
    /// An idle sender was already send-receive, so nothing will signal
    /// negotiation-needed; the caller must run an offer cycle.
    ManualRenegotiation,
    /// No video sender existed; a new one was added.
    SenderAdded,
}

// ---------------------------------------------------------------------------
// TrackManager
// ---------------------------------------------------------------------------

/// Owner of every local capture.
///
/// Lives inside the meeting session actor, which is the only caller; all
/// toggles are therefore serialized.
pub struct TrackManager {
    devices: Arc<dyn MediaDevices>,
    camera: Option<LocalStream>,
    screen: Option<LocalStream>,
    state: LocalMediaState,
    acquired: bool,
}

impl TrackManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        TrackManager {
            devices,
            camera: None,
            screen: None,
            state: LocalMediaState::default(),
            acquired: false,
        }
    }

    /// Acquire the camera/microphone stream: audio+video first, audio-only
    /// second, then give up.  Runs the ladder once per session.
    pub async fn acquire(&mut self) -> Result<&LocalStream> {
        if !self.acquired {
            self.acquired = true;
            let ladder = [
                MediaConstraints {
                    audio: true,
                    video: true,
                },
                MediaConstraints {
                    audio: true,
                    video: false,
                },
            ];
            for constraints in ladder {
                match self.devices.user_media(constraints).await {
                    Ok(stream) => {
                        info!(
                            stream_id = %stream.id,
                            audio = constraints.audio,
                            video = constraints.video,
                            "local media acquired"
                        );
                        self.state.mic_enabled = stream.audio_track().is_some();
                        self.state.camera_enabled = stream.video_track().is_some();
                        self.camera = Some(stream);
                        break;
                    }
                    Err(e) => {
                        warn!(
                            audio = constraints.audio,
                            video = constraints.video,
                            "capture attempt failed: {e}"
                        );
                    }
                }
            }
        }
        self.camera.as_ref().ok_or(MeshError::NoUsableDevice)
    }

    pub fn state(&self) -> LocalMediaState {
        self.state
    }

    pub fn camera_stream(&self) -> Option<&LocalStream> {
        self.camera.as_ref()
    }

    pub fn screen_stream(&self) -> Option<&LocalStream> {
        self.screen.as_ref()
    }

    /// The stream that should currently be sent.
    pub fn outgoing_stream(&self) -> Option<&LocalStream> {
        match (&self.screen, &self.camera) {
            (Some(screen), _) if self.state.screen_sharing => Some(screen),
            (_, Some(camera)) => Some(camera),
            _ => None,
        }
    }

    /// Tracks that should be on every connection: the outgoing stream's
    /// tracks, plus the microphone while sharing a screen without audio.
    pub fn outgoing_tracks(&self) -> Vec<LocalTrack> {
        let mut tracks: Vec<LocalTrack> = self
            .outgoing_stream()
            .map(|s| s.tracks.clone())
            .unwrap_or_default();
        if self.state.screen_sharing && !tracks.iter().any(|t| t.kind() == TrackKind::Audio) {
            if let Some(mic) = self.camera.as_ref().and_then(|c| c.audio_track()) {
                tracks.push(mic.clone());
            }
        }
        tracks
    }

    fn is_live_local(&self, track_id: &str) -> bool {
        self.camera
            .iter()
            .chain(self.screen.iter())
            .flat_map(|s| s.tracks.iter())
            .any(|t| t.id() == track_id && t.is_live())
    }

    /// Put every outgoing track that is not yet on `conn` onto it.
    ///
    /// Presence is checked by track id.  An idle sender of the same kind is
    /// reused before a new one is added.  Returns the number of tracks
    /// attached.
    pub async fn attach_to_connection(&self, conn: &dyn MediaConnection) -> Result<usize> {
        let mut senders = conn.senders().await;
        let mut attached = 0;

        for track in self.outgoing_tracks() {
            if senders
                .iter()
                .any(|s| s.track_id.as_deref() == Some(track.id()))
            {
                continue;
            }

            let idle = senders
                .iter_mut()
                .find(|s| s.kind == track.kind() && s.track_id.is_none());
            match idle {
                Some(sender) => {
                    conn.replace_track(sender.index, Some(&track)).await?;
                    if !sender.direction.sends() {
                        conn.set_direction(sender.index, Direction::SendRecv).await?;
                        sender.direction = Direction::SendRecv;
                    }
                    sender.track_id = Some(track.id().to_string());
                }
                None => {
                    conn.add_track(&track).await?;
                    senders = conn.senders().await;
                }
            }
            debug!(track_id = %track.id(), kind = %track.kind(), "track attached");
            attached += 1;
        }
        Ok(attached)
    }

    /// Start sharing the screen on every given connection.
    ///
    /// Returns the per-peer outcome; peers whose swap failed are logged and
    /// left out.  Calling while already sharing is a no-op.
    pub async fn start_screen_share(
        &mut self,
        links: &[(String, Arc<dyn MediaConnection>)],
    ) -> Result<Vec<(String, ShareOutcome)>> {
        if self.state.screen_sharing {
            return Ok(Vec::new());
        }

        let stream = self.devices.display_media().await?;
        let Some(screen_track) = stream.video_track().cloned() else {
            stream.stop();
            return Err(MeshError::DisplayCaptureUnavailable(
                "display stream carries no video".into(),
            ));
        };

        let mut outcomes = Vec::with_capacity(links.len());
        for (peer_id, conn) in links {
            match self.switch_to_screen(conn.as_ref(), &screen_track).await {
                Ok(outcome) => {
                    debug!(peer_id = %peer_id, ?outcome, "screen track attached");
                    outcomes.push((peer_id.clone(), outcome));
                }
                Err(e) => warn!(peer_id = %peer_id, "screen share swap failed: {e}"),
            }
        }

        info!(stream_id = %stream.id, peers = links.len(), "screen share started");
        self.screen = Some(stream);
        self.state.screen_sharing = true;
        Ok(outcomes)
    }

    async fn switch_to_screen(
        &self,
        conn: &dyn MediaConnection,
        screen: &LocalTrack,
    ) -> Result<ShareOutcome> {
        let senders = conn.senders().await;
        let camera_id = self
            .camera
            .as_ref()
            .and_then(|c| c.video_track())
            .map(|t| t.id().to_string());
        let video = senders
            .iter()
            .find(|s| s.kind == TrackKind::Video && s.track_id.is_some() && s.track_id == camera_id)
            .or_else(|| senders.iter().find(|s| s.kind == TrackKind::Video));

        let Some(sender) = video else {
            conn.add_track(screen).await?;
            return Ok(ShareOutcome::SenderAdded);
        };

        let live = sender
            .track_id
            .as_deref()
            .is_some_and(|id| self.is_live_local(id));
        conn.replace_track(sender.index, Some(screen)).await?;

        if live {
            Ok(ShareOutcome::ReplacedInPlace)
        } else if !sender.direction.sends() {
            conn.set_direction(sender.index, Direction::SendRecv).await?;
            Ok(ShareOutcome::DirectionFlipped)
        } else {
            Ok(ShareOutcome::ManualRenegotiation)
        }
    }

    /// Stop sharing: end the capture and put the camera track (or nothing)
    /// back on every video sender that carried the screen.  Never
    /// renegotiates.  Calling while not sharing is a no-op.
    pub async fn stop_screen_share(
        &mut self,
        links: &[(String, Arc<dyn MediaConnection>)],
    ) -> Result<usize> {
        if !self.state.screen_sharing {
            return Ok(0);
        }
        let Some(screen) = self.screen.take() else {
            self.state.screen_sharing = false;
            return Ok(0);
        };
        screen.stop();
        self.state.screen_sharing = false;

        let camera_track = self.camera.as_ref().and_then(|c| c.video_track()).cloned();
        let mut restored = 0;
        for (peer_id, conn) in links {
            let senders = conn.senders().await;
            let target = senders
                .iter()
                .find(|s| s.track_id.as_deref().is_some_and(|id| screen.contains(id)))
                .or_else(|| senders.iter().find(|s| s.kind == TrackKind::Video));
            let Some(sender) = target else {
                continue;
            };
            match conn.replace_track(sender.index, camera_track.as_ref()).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(peer_id = %peer_id, "camera restore failed: {e}"),
            }
        }

        info!(stream_id = %screen.id, restored, "screen share stopped");
        Ok(restored)
    }

    /// Mute or unmute the microphone.  Returns `false` if there is none.
    pub fn set_microphone(&mut self, enabled: bool) -> bool {
        let Some(mic) = self.camera.as_ref().and_then(|c| c.audio_track()) else {
            return false;
        };
        mic.set_enabled(enabled);
        self.state.mic_enabled = enabled;
        true
    }

    /// Enable or disable the camera.  Returns `false` if there is none.
    pub fn set_camera(&mut self, enabled: bool) -> bool {
        let Some(cam) = self.camera.as_ref().and_then(|c| c.video_track()) else {
            return false;
        };
        cam.set_enabled(enabled);
        self.state.camera_enabled = enabled;
        true
    }

    /// Stop and release every capture.
    pub fn stop_all(&mut self) {
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        if let Some(camera) = self.camera.take() {
            camera.stop();
        }
        self.state = LocalMediaState::default();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
