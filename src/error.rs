use thiserror::Error;

// ─── MeshError ──────────────────────────────────────────────────────────────

/// Every failure the negotiation engine can surface.
///
/// Each variant maps to a stable snake_case code (see [`MeshError::code`]) so
/// callers and log pipelines can match on failures without parsing messages.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The relay connection could not be opened or broke mid-session.
    #[error("signaling channel failure: {0}")]
    Signaling(String),

    /// A relay message could not be (de)serialised.
    #[error("malformed signaling message: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The underlying media connection rejected an operation.
    #[error("media connection failure: {0}")]
    Connection(String),

    /// The operation is not valid in the connection's current signaling
    /// state. Perfect Negotiation treats this as a glare side-effect.
    #[error("operation '{operation}' not allowed in signaling state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// A single capture request was refused.
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Neither audio+video nor audio-only capture could be acquired.
    #[error("no usable capture device")]
    NoUsableDevice,

    /// Display capture was refused or is not supported.
    #[error("display capture unavailable: {0}")]
    DisplayCaptureUnavailable(String),

    /// A signal arrived from someone who is not in the room roster.
    #[error("unknown peer '{0}'")]
    UnknownPeer(String),

    /// The meeting session has already been torn down.
    #[error("meeting session is closed")]
    SessionClosed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = MeshError> = std::result::Result<T, E>;

impl MeshError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Signaling(_) => "signaling_failed",
            Self::Protocol(_) => "protocol_error",
            Self::Connection(_) => "connection_failed",
            Self::InvalidState { .. } => "invalid_state",
            Self::DeviceUnavailable(_) => "device_unavailable",
            Self::NoUsableDevice => "no_usable_device",
            Self::DisplayCaptureUnavailable(_) => "display_capture_unavailable",
            Self::UnknownPeer(_) => "unknown_peer",
            Self::SessionClosed => "session_closed",
            Self::Config(_) => "invalid_config",
        }
    }

    /// `true` for the "wrong state to negotiate right now" failure.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }
}

// ─── Conversions ────────────────────────────────────────────────────────────

impl From<webrtc::Error> for MeshError {
    fn from(err: webrtc::Error) -> Self {
        match err {
            webrtc::Error::ErrIncorrectSignalingState | webrtc::Error::ErrNoRemoteDescription => {
                Self::InvalidState {
                    operation: "webrtc",
                    state: err.to_string(),
                }
            }
            other => Self::Connection(other.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MeshError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Signaling(err.to_string())
    }
}

impl From<url::ParseError> for MeshError {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("invalid signaling url: {err}"))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
