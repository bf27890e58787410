//! Configuration system for vidstream.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VIDSTREAM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/vidstream/config.toml
//!   3. ~/.config/vidstream/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub reassembly: ReassemblyConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Streaming server host name or address.
    pub host: String,
    /// Streaming server UDP port.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local UDP port to bind. 0 = OS-assigned.
    pub local_port: u16,
    /// How long to wait for REGISTERED before giving up.
    pub registration_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Receive poll interval. Bounds how long a stop request can go unnoticed.
    pub recv_poll_ms: u64,
    /// Periodic stats report. 0 = disabled.
    pub stats_interval_secs: u64,
    /// Largest datagram the receive loop accepts.
    pub recv_buffer_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Byte stride between chunk indices. Must match the server's chunk size.
    pub chunk_payload_size: u64,
    /// Largest frame a FRAME_START may announce.
    pub max_frame_bytes: u64,
    /// Incomplete frames older than this are evicted.
    pub staleness_ms: u64,
    /// Frames reassembled concurrently before the oldest is evicted.
    pub max_pending_frames: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Write every completed frame here. None = log only.
    pub dir: Option<PathBuf>,
    pub format: StreamFormat,
}

/// Encoding of the frames the server sends. Only affects naming and logging;
/// decoding belongs to whoever consumes the frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    #[default]
    Jpeg,
    H264,
}

impl StreamFormat {
    pub fn extension(self) -> &'static str {
        match self {
            StreamFormat::Jpeg => "jpg",
            StreamFormat::H264 => "h264",
        }
    }
}

impl std::str::FromStr for StreamFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(StreamFormat::Jpeg),
            "h264" => Ok(StreamFormat::H264),
            other => Err(ConfigError::Invalid(format!("unknown stream format {other:?}"))),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            registration_timeout_secs: 5,
            keepalive_interval_secs: 5,
            recv_poll_ms: 1000,
            stats_interval_secs: 5,
            recv_buffer_bytes: 65536,
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            chunk_payload_size: 1200,
            max_frame_bytes: 16 * 1024 * 1024,
            staleness_ms: 3000,
            max_pending_frames: 64,
        }
    }
}

impl ClientConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn recv_poll(&self) -> Duration {
        Duration::from_millis(self.recv_poll_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

impl ReassemblyConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("vidstream")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl StreamConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            StreamConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("VIDSTREAM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&StreamConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.reassembly.chunk_payload_size == 0, "reassembly.chunk_payload_size"),
            (self.reassembly.max_frame_bytes == 0, "reassembly.max_frame_bytes"),
            (self.reassembly.max_pending_frames == 0, "reassembly.max_pending_frames"),
            (self.client.keepalive_interval_secs == 0, "client.keepalive_interval_secs"),
            (self.client.recv_poll_ms == 0, "client.recv_poll_ms"),
            (self.client.recv_buffer_bytes == 0, "client.recv_buffer_bytes"),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, field)) => Err(ConfigError::Invalid(format!("{field} must be non-zero"))),
            None => Ok(()),
        }
    }

    /// Apply VIDSTREAM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VIDSTREAM_SERVER__HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("VIDSTREAM_SERVER__PORT") {
            if let Ok(p) = v.parse() {
                self.server.port = p;
            }
        }
        if let Ok(v) = std::env::var("VIDSTREAM_CLIENT__LOCAL_PORT") {
            if let Ok(p) = v.parse() {
                self.client.local_port = p;
            }
        }
        if let Ok(v) = std::env::var("VIDSTREAM_OUTPUT__DIR") {
            self.output.dir = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("VIDSTREAM_OUTPUT__FORMAT") {
            if let Ok(format) = v.parse() {
                self.output.format = format;
            }
        }
    }
}
