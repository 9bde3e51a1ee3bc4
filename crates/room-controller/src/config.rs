//! Room Controller configuration.
//!
//! Configuration is loaded from environment variables. Sensitive fields
//! are redacted in Debug output.

use crate::access::PolicyOverrides;
use crate::turn::TurnServer;
use common::secret::SecretString;
use media_engine::RouterCodecConfig;
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default bind address for the signaling and health endpoints.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:4443";

/// Default peer RPC round-trip budget in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 20_000;

/// Default peer RPC retry count (timeouts only).
pub const DEFAULT_REQUEST_RETRIES: u32 = 3;

/// Default delay before an empty room closes itself, in seconds.
pub const DEFAULT_SELF_DESTRUCT_DELAY_SECONDS: u64 = 10;

/// Default worker load above which piped routers stop attracting peers.
pub const DEFAULT_ROUTER_SCALE_SIZE: u32 = 40;

/// Default TURN credential API timeout in milliseconds.
pub const DEFAULT_TURN_API_TIMEOUT_MS: u64 = 2_000;

/// Room Controller configuration.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Clone)]
pub struct Config {
    /// Bind address for the signaling and health endpoints.
    pub listen_address: String,

    /// Peer RPC round-trip budget in milliseconds.
    pub request_timeout_ms: u64,

    /// Peer RPC retries on timeout.
    pub request_retries: u32,

    /// Delay before an empty room closes itself, in seconds.
    pub self_destruct_delay_seconds: u64,

    /// Worker load above which piped routers stop attracting peers.
    pub router_scale_size: u32,

    /// Room capacity counting joined and parked peers (None = unlimited).
    pub max_peers_per_room: Option<u32>,

    /// Park guests until a host joins an empty room.
    pub activate_on_host_join: bool,

    /// Rooms exempt from locking; a non-empty list locks every other
    /// room at creation.
    pub rooms_unlocked: Vec<String>,

    /// Max incoming bitrate applied to new transports (None = engine
    /// default).
    pub max_incoming_bitrate: Option<u32>,

    /// TURN credential API endpoint.
    pub turn_api_url: Option<String>,

    /// TURN credential API key. Redacted in Debug output.
    pub turn_api_key: Option<SecretString>,

    /// TURN credential API timeout in milliseconds.
    pub turn_api_timeout_ms: u64,

    /// Static relay servers used when the credential API is missing or
    /// failing.
    pub backup_turn_servers: Vec<TurnServer>,

    /// Access/permission table overrides merged at room construction.
    pub policy_overrides: PolicyOverrides,

    /// Router media codec configuration passed through to the engine.
    pub router_media_codecs: RouterCodecConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listen_address", &self.listen_address)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("request_retries", &self.request_retries)
            .field(
                "self_destruct_delay_seconds",
                &self.self_destruct_delay_seconds,
            )
            .field("router_scale_size", &self.router_scale_size)
            .field("max_peers_per_room", &self.max_peers_per_room)
            .field("activate_on_host_join", &self.activate_on_host_join)
            .field("rooms_unlocked", &self.rooms_unlocked)
            .field("max_incoming_bitrate", &self.max_incoming_bitrate)
            .field("turn_api_url", &self.turn_api_url)
            .field("turn_api_key", &self.turn_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("turn_api_timeout_ms", &self.turn_api_timeout_ms)
            .field("backup_turn_servers", &self.backup_turn_servers.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let listen_address = vars
            .get("ROOM_LISTEN_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string());

        let request_timeout_ms = parse_or(vars, "ROOM_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?;
        let request_retries = parse_or(vars, "ROOM_REQUEST_RETRIES", DEFAULT_REQUEST_RETRIES)?;
        let self_destruct_delay_seconds = parse_or(
            vars,
            "ROOM_SELF_DESTRUCT_DELAY_SECONDS",
            DEFAULT_SELF_DESTRUCT_DELAY_SECONDS,
        )?;
        let router_scale_size = parse_or(vars, "ROOM_ROUTER_SCALE_SIZE", DEFAULT_ROUTER_SCALE_SIZE)?;
        let turn_api_timeout_ms =
            parse_or(vars, "ROOM_TURN_API_TIMEOUT_MS", DEFAULT_TURN_API_TIMEOUT_MS)?;

        let max_peers_per_room = parse_optional(vars, "ROOM_MAX_PEERS")?;
        let max_incoming_bitrate = parse_optional(vars, "ROOM_MAX_INCOMING_BITRATE")?;

        let activate_on_host_join = vars
            .get("ROOM_ACTIVATE_ON_HOST_JOIN")
            .is_some_and(|value| value == "1" || value.eq_ignore_ascii_case("true"));

        let rooms_unlocked = vars
            .get("ROOM_ROOMS_UNLOCKED")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let backup_turn_servers = match vars.get("ROOM_BACKUP_TURN_SERVERS") {
            Some(raw) => serde_json::from_str(raw).map_err(|err| {
                ConfigError::InvalidValue("ROOM_BACKUP_TURN_SERVERS", err.to_string())
            })?,
            None => Vec::new(),
        };

        let policy_overrides = match vars.get("ROOM_POLICY_OVERRIDES") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|err| ConfigError::InvalidValue("ROOM_POLICY_OVERRIDES", err.to_string()))?,
            None => PolicyOverrides::default(),
        };

        let router_media_codecs = match vars.get("ROOM_ROUTER_MEDIA_CODECS") {
            Some(raw) => RouterCodecConfig(serde_json::from_str(raw).map_err(|err| {
                ConfigError::InvalidValue("ROOM_ROUTER_MEDIA_CODECS", err.to_string())
            })?),
            None => RouterCodecConfig::default(),
        };

        Ok(Config {
            listen_address,
            request_timeout_ms,
            request_retries,
            self_destruct_delay_seconds,
            router_scale_size,
            max_peers_per_room,
            activate_on_host_join,
            rooms_unlocked,
            max_incoming_bitrate,
            turn_api_url: vars.get("ROOM_TURN_API_URL").cloned(),
            turn_api_key: vars
                .get("ROOM_TURN_API_KEY")
                .map(|key| SecretString::from(key.clone())),
            turn_api_timeout_ms,
            backup_turn_servers,
            policy_overrides,
            router_media_codecs,
        })
    }

    /// Whether a room with this id starts locked.
    #[must_use]
    pub fn room_starts_locked(&self, room_id: &str) -> bool {
        !self.rooms_unlocked.is_empty() && !self.rooms_unlocked.iter().any(|name| name == room_id)
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key, raw.clone())),
        None => Ok(default),
    }
}

fn parse_optional<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key, raw.clone())),
        None => Ok(None),
    }
}
