//! Configuration for fbx clients
//!
//! Config files are read from platform-appropriate locations:
//! - Linux: ~/.config/fbx/
//! - macOS: ~/Library/Application Support/fbx/
//! - Windows: %APPDATA%\fbx\
//!
//! The config only tunes how the client talks to the device. Registration
//! results are handed back to the caller and never written here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tls::TrustAnchor;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to read CA file {path}: {source}")]
    CaFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Config directory not found")]
    NoDirFound,

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub registration: RegistrationConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// How to reach the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Fixed local endpoint used for discovery and registration
    #[serde(default = "default_local_url")]
    pub local_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub trust: TrustConfig,
}

/// TLS trust policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Custom PEM root CA to pin instead of the vendor one
    pub ca_file: Option<PathBuf>,

    /// Use the system roots and no pinned CA
    #[serde(default)]
    pub system_roots: bool,
}

/// Registration handshake settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Delay between authorization status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_app_version")]
    pub app_version: String,

    #[serde(default = "default_device_name")]
    pub device_name: String,
}

/// Session handling settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Open a session before the first request instead of waiting for a 403
    #[serde(default)]
    pub auto_login: bool,
}

fn default_local_url() -> String {
    crate::DEFAULT_LOCAL_URL.to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    2000
}
fn default_app_version() -> String {
    "1.0.0".to_string()
}
fn default_device_name() -> String {
    "Rust".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            local_url: default_local_url(),
            request_timeout_secs: default_request_timeout(),
            trust: TrustConfig::default(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            app_version: default_app_version(),
            device_name: default_device_name(),
        }
    }
}

impl DeviceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RegistrationConfig {
    /// Never zero; a programmatic `poll_interval_ms = 0` polls every millisecond.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl TrustConfig {
    /// Resolve the trust anchor; a CA file wins over `system_roots`.
    pub fn anchor(&self) -> Result<TrustAnchor, ConfigError> {
        if let Some(ref path) = self.ca_file {
            let pem = std::fs::read(path).map_err(|source| ConfigError::CaFile {
                path: path.clone(),
                source,
            })?;
            return Ok(TrustAnchor::Pem(pem));
        }

        if self.system_roots {
            Ok(TrustAnchor::System)
        } else {
            Ok(TrustAnchor::FreeboxRootCa)
        }
    }
}

impl Config {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join("fbx"))
            .ok_or(ConfigError::NoDirFound)
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registration.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "registration.poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
