//! Configuration management for the Shadow controller.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shadow/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("protocol must be ws or wss, got {0}")]
    InvalidProtocol(String),

    #[error("port must be a number between 1 and 65535, got {0}")]
    InvalidPort(String),

    #[error("host must not be empty")]
    EmptyHost,

    #[error("keepalive_interval_secs must be greater than 0")]
    InvalidKeepalive,

    #[error("client_name must not be empty")]
    EmptyClientName,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Schemes the device manager listens on.
const VALID_PROTOCOLS: &[&str] = &["ws", "wss"];

/// Main configuration structure for the Shadow controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General controller configuration.
    pub controller: ControllerConfig,

    /// First-run connection settings.
    pub connection: ConnectionConfig,

    /// Session timing.
    pub session: SessionConfig,
}

/// General controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Directory holding the settings store.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Name shown to the device manager when pairing.
    pub client_name: String,
}

/// Connection defaults written into the settings store on first run.
///
/// Once the store holds connection settings, those win over this section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// `ws` or `wss`.
    pub protocol: String,

    /// Device manager host.
    pub host: String,

    /// Device manager port, kept as a string like the stored settings.
    pub port: String,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds between keepalive pings once connected.
    pub keepalive_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            client_name: "Shadow Controller".to_string(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol: "ws".to_string(),
            host: "127.0.0.1".to_string(),
            port: "7682".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 20,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shadow")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shadow")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHADOW_HOST: Override the first-run device manager host
    /// - SHADOW_PORT: Override the first-run device manager port
    /// - SHADOW_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("SHADOW_HOST") {
            if !host.is_empty() {
                tracing::info!("Overriding host from environment: {}", host);
                self.connection.host = host;
            }
        }

        if let Ok(port) = std::env::var("SHADOW_PORT") {
            if !port.is_empty() {
                tracing::info!("Overriding port from environment: {}", port);
                self.connection.port = port;
            }
        }

        if let Ok(level) = std::env::var("SHADOW_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.controller.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_PROTOCOLS.contains(&self.connection.protocol.as_str()) {
            return Err(ConfigError::InvalidProtocol(
                self.connection.protocol.clone(),
            ));
        }

        if self.connection.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        match self.connection.port.parse::<u16>() {
            Ok(port) if port > 0 => {}
            _ => return Err(ConfigError::InvalidPort(self.connection.port.clone())),
        }

        if self.session.keepalive_interval_secs == 0 {
            return Err(ConfigError::InvalidKeepalive);
        }

        if self.controller.client_name.trim().is_empty() {
            return Err(ConfigError::EmptyClientName);
        }

        let level = self.controller.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(
                self.controller.log_level.clone(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
