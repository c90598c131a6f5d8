//! Configuration management

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pqchat_crypto::{CryptoError, HybridCipher};

use crate::protocol::{MAX_FRAME_SIZE, MIN_FRAME_SIZE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub quic_cert_path: PathBuf,
    pub quic_key_path: PathBuf,
    /// SQLite file for envelopes and public keys. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// Hex-encoded Ed25519 key that signs session tokens.
    pub issuer_public_key: Option<String>,
    pub kem: String,
    pub aead: String,
    pub max_frame_size: usize,
    pub idle_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub http_addr: Option<SocketAddr>,
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4433)),
            quic_cert_path: PathBuf::from("cert.pem"),
            quic_key_path: PathBuf::from("key.pem"),
            database_path: None,
            issuer_public_key: None,
            kem: "kyber768".to_string(),
            aead: "aes-256-gcm".to_string(),
            max_frame_size: MAX_FRAME_SIZE,
            idle_timeout_secs: 60,
            keepalive_interval_secs: 15,
            http_addr: None,
            admin_token: None,
        }
    }
}

fn invalid(field: &str, e: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid(format!("Invalid {}: {}", field, e))
}

impl ServerConfig {
    /// Load configuration from environment variables, command line, and TOML file
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.load_from_env()?;

        let args: Vec<String> = std::env::args().collect();
        let config_path = config.load_from_args(&args)?;

        // An explicit --config wins over PQCHAT_RELAY_CONFIG.
        if let Some(path) = config_path.or_else(|| std::env::var("PQCHAT_RELAY_CONFIG").ok()) {
            let content = std::fs::read_to_string(&path)?;
            config.load_from_toml(&content)?;
        }

        config.validate()?;
        config.check_files()?;

        Ok(config)
    }

    fn load_from_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = std::env::var("PQCHAT_RELAY_LISTEN_ADDR") {
            self.listen_addr = addr.parse().map_err(|e| invalid("listen_addr", e))?;
        }
        if let Ok(path) = std::env::var("PQCHAT_RELAY_CERT_PATH") {
            self.quic_cert_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("PQCHAT_RELAY_KEY_PATH") {
            self.quic_key_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("PQCHAT_RELAY_DATABASE") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Ok(key) = std::env::var("PQCHAT_RELAY_ISSUER_KEY") {
            self.issuer_public_key = Some(key);
        }
        if let Ok(token) = std::env::var("PQCHAT_RELAY_ADMIN_TOKEN") {
            self.admin_token = Some(token);
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(ConfigError::Invalid(format!("max_frame_size must be >= {}", MIN_FRAME_SIZE)));
        }

        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("idle_timeout_secs must be > 0".to_string()));
        }

        if self.issuer_public_key.is_none() {
            return Err(ConfigError::Invalid("issuer_public_key is required".to_string()));
        }

        self.build_cipher().map_err(|e| invalid("cipher suite", e))?;

        if let Some(token) = &self.admin_token {
            if token.len() < 16 {
                return Err(ConfigError::Invalid("admin_token must be at least 16 characters".to_string()));
            }
        }

        Ok(())
    }

    fn check_files(&self) -> Result<(), ConfigError> {
        if !self.quic_cert_path.exists() {
            return Err(ConfigError::Invalid(format!(
                "Certificate file not found: {:?}",
                self.quic_cert_path
            )));
        }

        if !self.quic_key_path.exists() {
            return Err(ConfigError::Invalid(format!(
                "Key file not found: {:?}",
                self.quic_key_path
            )));
        }

        Ok(())
    }

    /// The hybrid suite named by `kem` and `aead`.
    pub fn build_cipher(&self) -> Result<HybridCipher, CryptoError> {
        HybridCipher::from_names(&self.kem, &self.aead)
    }

    /// Apply command line flags. Returns the `--config` path, if given.
    fn load_from_args(&mut self, args: &[String]) -> Result<Option<String>, ConfigError> {
        let mut config_path = None;
        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            let takes_value = matches!(
                flag,
                "--listen-addr" | "-l" | "--cert" | "-c" | "--key" | "-k" | "--database" | "-d"
                    | "--issuer-key" | "--http-addr" | "--admin-token" | "--config" | "-f"
            );
            if !takes_value {
                i += 1;
                continue;
            }
            let Some(value) = args.get(i + 1) else {
                return Err(ConfigError::Invalid(format!("{} requires a value", flag)));
            };

            match flag {
                "--listen-addr" | "-l" => {
                    self.listen_addr = value.parse().map_err(|e| invalid("listen_addr", e))?;
                }
                "--cert" | "-c" => self.quic_cert_path = PathBuf::from(value),
                "--key" | "-k" => self.quic_key_path = PathBuf::from(value),
                "--database" | "-d" => self.database_path = Some(PathBuf::from(value)),
                "--issuer-key" => self.issuer_public_key = Some(value.clone()),
                "--http-addr" => {
                    self.http_addr = Some(value.parse().map_err(|e| invalid("http_addr", e))?);
                }
                "--admin-token" => self.admin_token = Some(value.clone()),
                _ => config_path = Some(value.clone()),
            }
            i += 2;
        }
        Ok(config_path)
    }

    /// Apply values from a TOML document.
    pub fn load_from_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let toml_config: toml::Value = toml::from_str(content)?;

        let str_field = |name: &str| toml_config.get(name).and_then(|v| v.as_str());
        let int_field = |name: &str| toml_config.get(name).and_then(|v| v.as_integer());

        if let Some(addr) = str_field("listen_addr") {
            self.listen_addr = addr.parse().map_err(|e| invalid("listen_addr in TOML", e))?;
        }
        if let Some(path) = str_field("quic_cert_path") {
            self.quic_cert_path = PathBuf::from(path);
        }
        if let Some(path) = str_field("quic_key_path") {
            self.quic_key_path = PathBuf::from(path);
        }
        if let Some(path) = str_field("database_path") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(key) = str_field("issuer_public_key") {
            self.issuer_public_key = Some(key.to_string());
        }
        if let Some(kem) = str_field("kem") {
            self.kem = kem.to_string();
        }
        if let Some(aead) = str_field("aead") {
            self.aead = aead.to_string();
        }
        if let Some(size) = int_field("max_frame_size") {
            self.max_frame_size = usize::try_from(size).map_err(|e| invalid("max_frame_size", e))?;
        }
        if let Some(idle) = int_field("idle_timeout_secs") {
            self.idle_timeout_secs = u64::try_from(idle).map_err(|e| invalid("idle_timeout_secs", e))?;
        }
        if let Some(keepalive) = int_field("keepalive_interval_secs") {
            self.keepalive_interval_secs =
                u64::try_from(keepalive).map_err(|e| invalid("keepalive_interval_secs", e))?;
        }
        if let Some(addr) = str_field("http_addr") {
            self.http_addr = Some(addr.parse().map_err(|e| invalid("http_addr in TOML", e))?);
        }
        if let Some(token) = str_field("admin_token") {
            self.admin_token = Some(token.to_string());
        }

        Ok(())
    }
}
