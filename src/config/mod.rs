//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the `devstream` binary)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::protocol::{DEFAULT_ATTEMPT_TIMEOUT, RECEIVE_BUFFER_SIZE};
use crate::transport::TransportKind;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Device identity and broker transport
    #[serde(default)]
    pub device: DeviceConfig,

    /// Negotiation session settings
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Default config file location (`<config dir>/devstream/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("devstream").join("config.toml"))
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StreamError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| StreamError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Load `path`, or the default path if it exists, then apply environment overrides.
    ///
    /// An explicit `path` must exist; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, Self::default_path(), |key| std::env::var(key).ok())
    }

    fn load_with<F>(path: Option<&Path>, default_path: Option<PathBuf>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = match (path, default_path) {
            (Some(path), _) => {
                tracing::debug!("Loading config from {}", path.display());
                Self::from_file(path)?
            },
            (None, Some(path)) if path.exists() => {
                tracing::debug!("Loading config from {}", path.display());
                Self::from_file(&path)?
            },
            _ => Self::default(),
        };
        base.with_overrides(lookup)
    }

    /// Apply `DEVSTREAM_*` overrides read through `lookup`
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cs) = lookup("DEVSTREAM_CONNECTION_STRING") {
            self.device.connection_string = Some(cs);
        }
        if let Some(transport) = lookup("DEVSTREAM_TRANSPORT") {
            self.device.transport = transport.parse().map_err(StreamError::Config)?;
        }
        if let Some(secs) = lookup("DEVSTREAM_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|e| {
                StreamError::Config(format!("DEVSTREAM_TIMEOUT_SECS: {e}"))
            })?;
            self.session.timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(ms) = lookup("DEVSTREAM_TIMEOUT_MS") {
            self.session.timeout_ms = ms.parse().map_err(|e| {
                StreamError::Config(format!("DEVSTREAM_TIMEOUT_MS: {e}"))
            })?;
        }
        if let Some(flag) = lookup("DEVSTREAM_KEEP_LISTENING") {
            self.session.keep_listening = parse_flag("DEVSTREAM_KEEP_LISTENING", &flag)?;
        }
        if let Some(flag) = lookup("DEVSTREAM_ACCEPT") {
            self.session.accept_requests = parse_flag("DEVSTREAM_ACCEPT", &flag)?;
        }
        Ok(self)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(StreamError::Config(format!(
            "{key}: expected a boolean, got {value}"
        ))),
    }
}

/// Device configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device connection string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    /// Broker transport
    #[serde(default)]
    pub transport: TransportKind,
}

/// Negotiation session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Per-attempt timeout in milliseconds
    pub timeout_ms: u64,

    /// Keep running attempts until cancelled
    pub keep_listening: bool,

    /// Accept incoming stream requests (false rejects them)
    pub accept_requests: bool,

    /// Receive buffer size in bytes (one frame)
    pub receive_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_ATTEMPT_TIMEOUT.as_millis() as u64,
            keep_listening: false,
            accept_requests: true,
            receive_buffer_size: RECEIVE_BUFFER_SIZE,
        }
    }
}

impl SessionConfig {
    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Set the per-attempt timeout (millisecond resolution, saturating)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Keep running attempts until cancelled
    pub fn with_keep_listening(mut self, keep_listening: bool) -> Self {
        self.keep_listening = keep_listening;
        self
    }

    /// Accept or reject incoming stream requests
    pub fn with_accept_requests(mut self, accept: bool) -> Self {
        self.accept_requests = accept;
        self
    }
}
