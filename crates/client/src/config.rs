//! Configuration management for alloc-exec.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/alloc-exec/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::DEFAULT_COMMAND;

/// Default address of the cluster HTTP API.
pub const DEFAULT_API_ADDRESS: &str = "http://127.0.0.1:4646";

/// Default time allowed for the exec websocket to connect.
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 30;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("api address must start with http:// or https://, got {0}")]
    InvalidAddress(String),

    #[error("default_command must not be empty")]
    EmptyDefaultCommand,

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Cluster API connection settings.
    pub api: ApiConfig,

    /// Exec session settings.
    pub exec: ExecConfig,

    /// Logging settings.
    pub log: LogConfig,
}

/// Cluster API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Base HTTP address of the API (e.g. `http://127.0.0.1:4646`).
    pub address: String,

    /// ACL token sent as `X-Nomad-Token`.
    pub token: Option<String>,

    /// Namespace to scope requests to.
    pub namespace: Option<String>,

    /// Region to forward requests to.
    pub region: Option<String>,
}

/// Exec session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecConfig {
    /// Command used when nothing has been persisted yet.
    pub default_command: String,

    /// Seconds allowed for the websocket to connect (0 = wait forever).
    pub dial_timeout_secs: u64,

    /// File holding the last used command.
    pub command_store: PathBuf,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory the log file is written to.
    pub dir: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_API_ADDRESS.to_string(),
            token: None,
            namespace: None,
            region: None,
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_command: DEFAULT_COMMAND.to_string(),
            dial_timeout_secs: DEFAULT_DIAL_TIMEOUT_SECS,
            command_store: default_data_dir().join("command.json"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: default_data_dir(),
        }
    }
}

impl ExecConfig {
    /// The dial timeout, or `None` when disabled.
    pub fn dial_timeout(&self) -> Option<Duration> {
        match self.dial_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("alloc-exec")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("alloc-exec")
}

/// Reads a non-empty environment variable.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - NOMAD_ADDR: Override the API address
    /// - NOMAD_TOKEN: Override the ACL token
    /// - NOMAD_NAMESPACE: Override the namespace
    /// - NOMAD_REGION: Override the region
    /// - ALLOC_EXEC_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Runs before logging is set up, so it returns the names of the
    /// variables it applied for the caller to log.
    pub fn apply_env_overrides(&mut self) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(address) = env_value("NOMAD_ADDR") {
            self.api.address = address;
            applied.push("NOMAD_ADDR");
        }

        if let Some(token) = env_value("NOMAD_TOKEN") {
            self.api.token = Some(token);
            applied.push("NOMAD_TOKEN");
        }

        if let Some(namespace) = env_value("NOMAD_NAMESPACE") {
            self.api.namespace = Some(namespace);
            applied.push("NOMAD_NAMESPACE");
        }

        if let Some(region) = env_value("NOMAD_REGION") {
            self.api.region = Some(region);
            applied.push("NOMAD_REGION");
        }

        if let Some(level) = env_value("ALLOC_EXEC_LOG_LEVEL") {
            self.log.level = level;
            applied.push("ALLOC_EXEC_LOG_LEVEL");
        }

        applied
    }

    /// A copy safe to print: the token is masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.api.token.is_some() {
            config.api.token = Some("<redacted>".to_string());
        }
        config
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let address = &self.api.address;
        if !address.starts_with("http://") && !address.starts_with("https://") {
            return Err(ConfigError::InvalidAddress(address.clone()));
        }

        if self.exec.default_command.trim().is_empty() {
            return Err(ConfigError::EmptyDefaultCommand);
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
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

    /// Save configuration to a file, creating parent directories as needed.
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

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
