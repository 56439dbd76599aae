//! Configuration types for a slimlink player.

use std::path::Path;
use std::time::Duration;

use md5::{Digest, Md5};
use serde::Deserialize;
use uuid::Uuid;

use crate::types::FormatTag;
use crate::{Error, Result};

/// Default control port of the streaming server.
pub const DEFAULT_CONTROL_PORT: u16 = 3483;

/// Longest player name the handshake can carry, in bytes.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Default HTTP port of the server's JSON-RPC side channel.
pub const DEFAULT_RPC_PORT: u16 = 9000;

/// Configuration for one player session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 16-byte unique device identifier.
    #[serde(skip)]
    pub device_id: [u8; 16],
    /// Human-readable player name.
    pub name: String,
    /// Model identity reported in the handshake.
    pub model: String,
    /// Formats the audio engine can play, in preference order.
    pub formats: Vec<FormatTag>,
    /// Control connection address (`host:port`).
    pub server_addr: String,
    /// JSON-RPC endpoint of the server.
    pub rpc_url: String,
    /// Run silent recovery on the first connection after process start.
    pub cold_open_recovery: bool,
    /// Timers and windows.
    pub timing: Timing,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new("slimlink", "127.0.0.1")
    }
}

impl SessionConfig {
    /// Create a configuration with a deterministic device id based on the player name.
    ///
    /// The same name always yields the same id, so the server recognizes the
    /// player across restarts.
    pub fn new(name: impl Into<String>, server_host: &str) -> Self {
        let name = name.into();
        Self {
            device_id: device_id_for(&name),
            model: "slimlink".to_string(),
            formats: vec![FormatTag::Flac, FormatTag::Pcm, FormatTag::Mp3, FormatTag::Aac],
            server_addr: format!("{server_host}:{DEFAULT_CONTROL_PORT}"),
            rpc_url: format!("http://{server_host}:{DEFAULT_RPC_PORT}/jsonrpc.js"),
            cold_open_recovery: true,
            timing: Timing::default(),
            name,
        }
    }

    /// Parse a TOML document.
    ///
    /// ```toml
    /// name = "Kitchen"
    /// server_addr = "192.168.1.10:3483"
    /// rpc_url = "http://192.168.1.10:9000/jsonrpc.js"
    ///
    /// [timing]
    /// heartbeat = 15000
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut config: SessionConfig = toml::from_str(s)?;
        if config.name.len() > MAX_NAME_LEN {
            return Err(Error::Protocol(format!(
                "player name of {} bytes exceeds {MAX_NAME_LEN}",
                config.name.len()
            )));
        }
        config.device_id = device_id_for(&config.name);
        Ok(config)
    }

    /// Load a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Device id as a hex string (no dashes). Used as the player key for the side channel.
    pub fn device_id_hex(&self) -> String {
        Uuid::from_bytes(self.device_id).simple().to_string()
    }

    /// Device id in MAC-address notation, the way the server names players.
    pub fn player_id(&self) -> String {
        self.device_id[..6]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

fn device_id_for(name: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(format!("slimlink:{name}").as_bytes());
    hasher.finalize().into()
}

/// Timers, windows and retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Heartbeat period while in the foreground.
    #[serde(with = "duration_ms")]
    pub heartbeat: Duration,
    /// Heartbeat period while backgrounded.
    #[serde(with = "duration_ms")]
    pub background_heartbeat: Duration,
    /// Inbound silence tolerated, as a multiple of the current heartbeat.
    pub inactivity_factor: f64,
    /// First reconnect delay.
    #[serde(with = "duration_ms")]
    pub backoff_base: Duration,
    /// Reconnect delay ceiling.
    #[serde(with = "duration_ms")]
    pub backoff_cap: Duration,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// How long a stall may last before the stream is declared dead.
    #[serde(with = "duration_ms")]
    pub stall_window: Duration,
    /// Period of authoritative position refreshes while playing.
    #[serde(with = "duration_ms")]
    pub position_refresh: Duration,
    /// Age after which a recovery snapshot is ignored.
    #[serde(with = "duration_ms")]
    pub recovery_grace: Duration,
    /// Deadline for every side-channel round-trip.
    #[serde(with = "duration_ms")]
    pub remote_timeout: Duration,
    /// Deadline for establishing the control connection.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            background_heartbeat: Duration::from_secs(30),
            inactivity_factor: 2.5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_reconnect_attempts: Some(10),
            stall_window: Duration::from_secs(5),
            position_refresh: Duration::from_secs(9),
            recovery_grace: Duration::from_secs(300),
            remote_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Timing {
    /// Heartbeat period for the given foreground state.
    pub fn heartbeat_for(&self, background: bool) -> Duration {
        if background {
            self.background_heartbeat
        } else {
            self.heartbeat
        }
    }

    /// Inbound silence after which the connection counts as failed.
    pub fn inactivity_timeout(&self, background: bool) -> Duration {
        self.heartbeat_for(background)
            .mul_f64(self.inactivity_factor.max(1.0))
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
