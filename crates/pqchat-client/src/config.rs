//! Configuration for the pqchat client
//!
//! Stored as TOML in the platform config directory:
//!
//! - Unix: `~/.config/pqchat/client.toml`
//! - Windows: `%APPDATA%\pqchat\client.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pqchat_crypto::{CryptoError, HybridCipher};
use pqchat_relay::protocol::{MAX_FRAME_SIZE, MIN_FRAME_SIZE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Client configuration
///
/// # Example TOML
///
/// ```toml
/// [relay]
/// address = "chat.example.org:4433"
/// server_name = "chat.example.org"
/// ca_cert_path = "/etc/pqchat/ca.pem"
/// token = ""
/// kem = "kyber768"
/// aead = "aes-256-gcm"
/// max_frame_size = 262144
///
/// [keys]
/// dir = ""  # Empty = default location
///
/// [logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub keys: KeysConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// `host:port` of the relay's QUIC listener
    #[serde(default = "default_address")]
    pub address: String,

    /// TLS server name to verify
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// PEM bundle of CA certificates to trust
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// Session token from the login service
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_kem")]
    pub kem: String,

    #[serde(default = "default_aead")]
    pub aead: String,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Largest frame accepted from or sent to the relay, in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_address() -> String {
    "127.0.0.1:4433".to_string()
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_kem() -> String {
    "kyber768".to_string()
}

fn default_aead() -> String {
    "aes-256-gcm".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            server_name: default_server_name(),
            ca_cert_path: None,
            token: None,
            kem: default_kem(),
            aead: default_aead(),
            timeout_seconds: default_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Secret key directory (empty = default location)
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from custom path or default
    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        match custom_path {
            Some(path) => Self::load(path),
            None => Self::load_default(),
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("io", "pqchat", "pqchat")
    }

    pub fn default_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("client.toml"))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create default configuration file if it doesn't exist
    pub fn create_default_if_missing() -> Result<bool, ConfigError> {
        if let Some(path) = Self::default_path() {
            if !path.exists() {
                Self::default().save(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.relay.address.contains(':') {
            return Err(ConfigError::ValidationError(format!(
                "Relay address '{}' must be host:port",
                self.relay.address
            )));
        }

        if self.relay.server_name.is_empty() {
            return Err(ConfigError::ValidationError("server_name must not be empty".to_string()));
        }

        if self.relay.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError("timeout_seconds must be > 0".to_string()));
        }

        if self.relay.max_frame_size < MIN_FRAME_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "max_frame_size must be >= {MIN_FRAME_SIZE}"
            )));
        }

        self.build_cipher()
            .map_err(|e| ConfigError::ValidationError(format!("Invalid cipher suite: {e}")))?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Valid values: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }

    pub fn build_cipher(&self) -> Result<HybridCipher, CryptoError> {
        HybridCipher::from_names(&self.relay.kem, &self.relay.aead)
    }

    /// Directory for secret keys, falling back to the platform data dir.
    pub fn key_dir(&self) -> Option<PathBuf> {
        self.keys
            .dir
            .clone()
            .filter(|dir| !dir.as_os_str().is_empty())
            .or_else(crate::keystore::FileSecretStorage::default_dir)
    }
}
