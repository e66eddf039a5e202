//! Server configuration
//!
//! Loaded from `switchboard.toml`. Every section and field is optional; a
//! missing file yields the defaults. TLS, CORS, auth and queue settings are
//! accepted so existing deployments parse, but nothing acts on them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Config file name inside the config directory
pub const CONFIG_FILE_NAME: &str = "switchboard.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub log: LogConfig,
    pub rooms: RoomsConfig,
    pub tls: TlsConfig,
    pub cors: CorsConfig,
    pub auth: AuthConfig,
    pub queue: QueueConfig,
}

/// Listener and reactor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    /// Seconds without inbound traffic before a client is closed; 0 disables
    pub idle_timeout_secs: u64,
    /// Housekeeping tick of the reactor
    pub poll_interval_ms: u64,
    pub read_buffer_size: usize,
    pub outbound_capacity: usize,
    pub handshake_timeout_secs: u64,
    pub frame_error_policy: FrameErrorAction,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_clients: 100,
            idle_timeout_secs: 300,
            poll_interval_ms: 200,
            read_buffer_size: 64 * 1024,
            outbound_capacity: 256,
            handshake_timeout_secs: 5,
            frame_error_policy: FrameErrorAction::Close,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Reaction to a malformed client frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameErrorAction {
    /// Close the connection
    #[default]
    Close,
    /// Discard the bytes, keep the connection
    Drop,
}

/// Heartbeat settings (read but not acted on by the reactor)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Write a daily log file in addition to the console
    pub enabled: bool,
    /// Log directory; defaults to `<data dir>/logs`
    pub path: Option<PathBuf>,
    /// Filter used when RUST_LOG is not set
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            filter: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Resolved log directory
    pub fn dir(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join("logs")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    pub enabled: bool,
    pub default_room: String,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_room: "general".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub token_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_key: "auth_token".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueDriver {
    #[default]
    Redis,
    Database,
    File,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    pub driver: QueueDriver,
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
        }
    }
}

impl Config {
    /// Parse and validate TOML text
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file; the file must exist
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load a config file, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Platform config location, e.g. `~/.config/switchboard/switchboard.toml`
    pub fn default_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.host.trim().is_empty() {
            return Err(Error::InvalidConfig("server.host must not be empty".into()));
        }
        if server.max_clients == 0 {
            return Err(Error::InvalidConfig("server.max_clients must be at least 1".into()));
        }
        if server.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "server.poll_interval_ms must be at least 1".into(),
            ));
        }
        if server.read_buffer_size == 0 || server.outbound_capacity == 0 {
            return Err(Error::InvalidConfig(
                "server.read_buffer_size and server.outbound_capacity must be positive".into(),
            ));
        }
        if server.handshake_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "server.handshake_timeout_secs must be at least 1".into(),
            ));
        }
        if self.rooms.enabled && self.rooms.default_room.trim().is_empty() {
            return Err(Error::InvalidConfig("rooms.default_room must not be empty".into()));
        }
        Ok(())
    }

    /// Enabled settings that have no effect on the server
    pub fn inert_features(&self) -> Vec<&'static str> {
        let mut inert = Vec::new();
        if self.tls.enabled {
            inert.push("tls");
        }
        if self.cors.enabled {
            inert.push("cors");
        }
        if self.auth.enabled {
            inert.push("auth");
        }
        if self.queue.enabled {
            inert.push("queue");
        }
        inert
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "onyx", "switchboard")
        .ok_or_else(|| Error::NotFound("Could not determine home directory".into()))
}
