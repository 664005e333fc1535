//! Client configuration.
//!
//! Values start from defaults, are overridden by `CHAT_*` environment
//! variables, then by an optional TOML file named in `CHAT_CLIENT_CONFIG`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::keys::DEFAULT_KEY_BITS;

/// Fixed service port of the relay's client endpoint.
pub const DEFAULT_PORT: u16 = 5002;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_KEY_READY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SESSION_QUEUE_DEPTH: usize = 64;

const MIN_KEY_BITS: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Connection settings for [`ChatClient`](crate::handshake::client::ChatClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// RSA modulus size for the per-attempt key pair.
    pub key_bits: usize,
    /// Deadline for reaching `Authenticated`, measured from the connect call.
    pub connect_timeout_secs: u64,
    /// How long the relay-key step waits for local key generation.
    pub key_ready_timeout_ms: u64,
    /// Buffered inbound messages and outbound commands per session.
    pub session_queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            key_bits: DEFAULT_KEY_BITS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            key_ready_timeout_ms: DEFAULT_KEY_READY_TIMEOUT_MS,
            session_queue_depth: DEFAULT_SESSION_QUEUE_DEPTH,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables and an optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("CHAT_HOST") {
            config.host = host;
        }

        if let Ok(port) = std::env::var("CHAT_PORT") {
            config.port = port
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid CHAT_PORT: {}", e)))?;
        }

        if let Ok(bits) = std::env::var("CHAT_RSA_KEY_SIZE") {
            config.key_bits = bits
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid CHAT_RSA_KEY_SIZE: {}", e)))?;
        }

        if let Ok(secs) = std::env::var("CHAT_CONNECT_TIMEOUT") {
            config.connect_timeout_secs = secs
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid CHAT_CONNECT_TIMEOUT: {}", e)))?;
        }

        if let Ok(path) = std::env::var("CHAT_CLIENT_CONFIG") {
            let content = std::fs::read_to_string(&path)?;
            config.merge_toml(&content)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses a complete configuration from TOML. Missing keys take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides only the keys present in `content`.
    fn merge_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let table: toml::Table = toml::from_str(content)?;

        if let Some(host) = table.get("host").and_then(|v| v.as_str()) {
            self.host = host.to_string();
        }
        if let Some(port) = table.get("port").and_then(|v| v.as_integer()) {
            self.port = u16::try_from(port)
                .map_err(|_| ConfigError::Invalid(format!("port out of range: {}", port)))?;
        }
        if let Some(bits) = table.get("key_bits").and_then(|v| v.as_integer()) {
            self.key_bits = usize::try_from(bits)
                .map_err(|_| ConfigError::Invalid(format!("key_bits out of range: {}", bits)))?;
        }
        if let Some(secs) = table.get("connect_timeout_secs").and_then(|v| v.as_integer()) {
            self.connect_timeout_secs = u64::try_from(secs).map_err(|_| {
                ConfigError::Invalid(format!("connect_timeout_secs out of range: {}", secs))
            })?;
        }
        if let Some(ms) = table.get("key_ready_timeout_ms").and_then(|v| v.as_integer()) {
            self.key_ready_timeout_ms = u64::try_from(ms).map_err(|_| {
                ConfigError::Invalid(format!("key_ready_timeout_ms out of range: {}", ms))
            })?;
        }
        if let Some(depth) = table.get("session_queue_depth").and_then(|v| v.as_integer()) {
            self.session_queue_depth = usize::try_from(depth).map_err(|_| {
                ConfigError::Invalid(format!("session_queue_depth out of range: {}", depth))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be > 0".to_string()));
        }
        if self.key_bits < MIN_KEY_BITS || self.key_bits % 8 != 0 {
            return Err(ConfigError::Invalid(format!(
                "key_bits must be a multiple of 8 and at least {}, got {}",
                MIN_KEY_BITS, self.key_bits
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("connect_timeout_secs must be > 0".to_string()));
        }
        if self.key_ready_timeout_ms == 0 {
            return Err(ConfigError::Invalid("key_ready_timeout_ms must be > 0".to_string()));
        }
        if self.session_queue_depth == 0 {
            return Err(ConfigError::Invalid("session_queue_depth must be > 0".to_string()));
        }
        Ok(())
    }

    /// `host:port` of the relay.
    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn key_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.key_ready_timeout_ms)
    }
}
