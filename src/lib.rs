//! Full-mesh WebRTC meeting participant.
//!
//! Every participant holds one peer connection to every other participant,
//! exchanges SDP and ICE candidates through a websocket relay, and resolves
//! offer collisions with Perfect Negotiation.  [`session::join`] is the entry
//! point; the returned [`session::MeetingHandle`] drives screen sharing,
//! mute toggles and leaving.

pub mod candidates;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod roster;
pub mod rtc;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{MeshError, Result};
pub use events::{EventBus, EventType, MeetingEvent};
pub use session::{join, MeetingHandle, MeetingSession, MeetingSnapshot, MeetingState};
