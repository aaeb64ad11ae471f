use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::error::{MeshError, Result};
use crate::media::DeviceProfile;

// ---------------------------------------------------------------------------
// Participant configuration, loaded from environment variables
// ---------------------------------------------------------------------------

/// Everything one meeting participant needs to join.
///
/// Every field comes from an environment variable prefixed with
/// `LIVERELAY_`.  Only the room id is mandatory; the rest default to values
/// suitable for a local relay.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Signaling ───────────────────────────────────────────────────────
    /// Relay websocket endpoint; `token` and `room_id` are appended as query
    /// parameters at connect time.
    pub signaling_url: String,
    pub room_id: String,
    pub token: String,
    pub display_name: String,

    // ── ICE ─────────────────────────────────────────────────────────────
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
    /// Full W3C `iceServers` list.  When set, replaces the STUN/TURN fields.
    pub ice_servers_override: Option<Vec<IceServerConfig>>,

    // ── Media ───────────────────────────────────────────────────────────
    /// Capture devices the synthetic source pretends to have.
    pub devices: DeviceProfile,
    /// UDP port range for ICE candidates (0/0 = OS picks).
    pub udp_port_min: u16,
    pub udp_port_max: u16,

    // ── Logging ─────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Config {
    /// Load from the process environment, reading a `.env` file first if
    /// one exists.  Runs before logging is up, so nothing is logged here;
    /// call [`Config::log_summary`] once the subscriber honours `log_level`.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let room_id = get("LIVERELAY_ROOM_ID")
            .ok_or_else(|| MeshError::Config("LIVERELAY_ROOM_ID is required".into()))?;

        let token = get("LIVERELAY_TOKEN").unwrap_or_default();

        let ice_servers_override = match get("LIVERELAY_ICE_SERVERS") {
            Some(raw) => Some(
                serde_json::from_str::<Vec<IceServerConfig>>(&raw)
                    .map_err(|e| MeshError::Config(format!("LIVERELAY_ICE_SERVERS: {e}")))?,
            ),
            None => None,
        };

        let devices = or("LIVERELAY_DEVICES", "audio_video").parse::<DeviceProfile>()?;

        let udp_port_min = parse_port(get("LIVERELAY_UDP_PORT_MIN"), "LIVERELAY_UDP_PORT_MIN")?;
        let udp_port_max = parse_port(get("LIVERELAY_UDP_PORT_MAX"), "LIVERELAY_UDP_PORT_MAX")?;
        if udp_port_min > udp_port_max {
            return Err(MeshError::Config(format!(
                "udp port range {udp_port_min}-{udp_port_max} is empty"
            )));
        }

        Ok(Config {
            signaling_url: or("LIVERELAY_SIGNALING_URL", "ws://localhost:8080/ws"),
            room_id,
            token,
            display_name: or("LIVERELAY_DISPLAY_NAME", "guest"),
            stun_urls: csv(get("LIVERELAY_STUN_URLS"), &["stun:stun.l.google.com:19302"]),
            turn_urls: csv(get("LIVERELAY_TURN_URLS"), &[]),
            turn_username: get("LIVERELAY_TURN_USERNAME"),
            turn_password: get("LIVERELAY_TURN_PASSWORD"),
            ice_servers_override,
            devices,
            udp_port_min,
            udp_port_max,
            log_level: or("LIVERELAY_LOG_LEVEL", "info"),
        })
    }

    /// The session's ICE server list.  Immutable once the session starts.
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        if let Some(servers) = &self.ice_servers_override {
            return servers.clone();
        }

        let mut servers: Vec<IceServerConfig> = self
            .stun_urls
            .iter()
            .map(|url| IceServerConfig {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect();

        if !self.turn_urls.is_empty() {
            servers.push(IceServerConfig {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_password.clone(),
            });
        }
        servers
    }

    pub fn log_summary(&self) {
        if self.token.is_empty() {
            warn!("LIVERELAY_TOKEN not set; the relay may refuse the connection");
        }
        info!("──── Mesh participant configuration ────");
        info!("  signaling_url  : {}", self.signaling_url);
        info!("  room_id        : {}", self.room_id);
        info!("  token          : {}", if self.token.is_empty() { "(not set)" } else { "(set)" });
        info!("  display_name   : {}", self.display_name);
        if self.ice_servers_override.is_some() {
            info!("  ice_servers    : (from LIVERELAY_ICE_SERVERS)");
        } else {
            info!("  stun_urls      : {:?}", self.stun_urls);
            info!("  turn_urls      : {:?}", self.turn_urls);
        }
        info!("  devices        : {:?}", self.devices);
        if self.udp_port_min != 0 || self.udp_port_max != 0 {
            info!("  udp_ports      : {}-{}", self.udp_port_min, self.udp_port_max);
        }
        info!("  log_level      : {}", self.log_level);
        info!("────────────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// ICE server entries
// ---------------------------------------------------------------------------

/// One entry of a W3C `RTCIceServer` list.  `urls` accepts a single string
/// or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn csv(value: Option<String>, defaults: &[&str]) -> Vec<String> {
    match value {
        Some(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

fn parse_port(value: Option<String>, key: &str) -> Result<u16> {
    match value {
        Some(v) => v
            .trim()
            .parse::<u16>()
            .map_err(|_| MeshError::Config(format!("{key}: '{v}' is not a port number"))),
        None => Ok(0),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
