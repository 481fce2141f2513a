//! Call configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for deployment.
//! Config precedence: env vars > .env file > mesh.toml > defaults

use crate::signal::IceServer;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<MeshConfig> = OnceLock::new();

/// Initialize the global configuration from environment.
///
/// Should be called once at startup, before any other code accesses config.
pub fn init() -> Result<&'static MeshConfig, config::ConfigError> {
    let cfg = load()?;
    Ok(CONFIG.get_or_init(|| cfg))
}

/// Build a configuration without touching the global.
pub fn load() -> Result<MeshConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("call.negotiation_timeout_ms", 15_000)?
        .set_default("media.audio", true)?
        .set_default("media.video", true)?
        .set_default("media.ideal_width", 1280)?
        .set_default("signaling.url", "ws://localhost:4000/signal")?
        .set_default("signaling.max_reconnect", 10)?
        .set_default("signaling.heartbeat_secs", 30)?
        // Optional config file
        .add_source(config::File::with_name("mesh").required(false))
        // Environment variables (MESH__CALL__NEGOTIATION_TIMEOUT_MS, MESH__SIGNALING__URL, etc.)
        .add_source(
            config::Environment::with_prefix("MESH")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("ice.stun_urls")
                .with_list_parse_key("ice.turn_urls")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MeshConfig {
    pub call: CallConfig,
    pub media: MediaConfig,
    #[serde(default)]
    pub ice: IceConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CallConfig {
    /// How long a connection may stay in negotiation before it is failed.
    pub negotiation_timeout_ms: u64,
}

impl CallConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 15_000,
        }
    }
}

/// Capture constraints requested from the media device.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
    pub ideal_width: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            ideal_width: 1280,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN relays, only used when credentials are configured too.
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceConfig {
    /// ICE servers to hand to every new peer connection.
    pub fn servers(&self) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer::stun(self.stun_urls.clone()));
        }
        if !self.turn_urls.is_empty() && self.username.is_some() && self.credential.is_some() {
            servers.push(IceServer {
                urls: self.turn_urls.clone(),
                username: self.username.clone(),
                credential: self.credential.clone(),
            });
        }
        servers
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            username: None,
            credential: None,
        }
    }
}

/// Public STUN endpoints (free, no credentials).
fn default_stun_urls() -> Vec<String> {
    [
        "stun:stun.l.google.com:19302",
        "stun:stun.l.google.com:5349",
        "stun:stun1.l.google.com:3478",
        "stun:stun1.l.google.com:5349",
        "stun:stun2.l.google.com:19302",
        "stun:stun2.l.google.com:5349",
        "stun:stun3.l.google.com:3478",
        "stun:stun3.l.google.com:5349",
        "stun:stun4.l.google.com:19302",
        "stun:stun4.l.google.com:5349",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// WebSocket endpoint of the signaling relay.
    pub url: String,
    /// Reconnect attempts before the transport gives up.
    pub max_reconnect: u32,
    pub heartbeat_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:4000/signal".into(),
            max_reconnect: 10,
            heartbeat_secs: 30,
        }
    }
}
