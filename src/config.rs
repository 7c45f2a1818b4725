//! Configuration module for the switchboard server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::{DEFAULT_MAX_BODY_SIZE, MAX_BODY_SIZE_LIMIT};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// What to do with inbound bytes that cannot be framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResyncPolicy {
    /// Drop unframed bytes and keep the connection.
    #[default]
    Lenient,
    /// Close the connection on the first unframed byte or malformed header.
    Strict,
}

/// How much to write per writability notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FlushPolicy {
    /// One write attempt; leftovers wait for the next pending-write sweep.
    #[default]
    Single,
    /// Keep writing until the buffer is empty or the socket would block.
    Drain,
}

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "switchboard")]
#[command(version = "0.1.0")]
#[command(about = "A multiplexed TCP message server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9999)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Poll timeout in milliseconds; bounds shutdown latency
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Write policy per writability notification
    #[arg(long, value_enum)]
    pub flush: Option<FlushPolicy>,

    /// Largest accepted frame body in bytes
    #[arg(long)]
    pub max_body_size: Option<usize>,

    /// Handling of bytes that cannot be framed
    #[arg(long, value_enum)]
    pub resync: Option<ResyncPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Events drained per poll call
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Bytes requested per socket read
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default)]
    pub flush: FlushPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            event_capacity: default_event_capacity(),
            read_chunk_size: default_read_chunk_size(),
            flush: FlushPolicy::default(),
        }
    }
}

/// Framing configuration
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub resync: ResyncPolicy,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            resync: ResyncPolicy::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TomlConfig {
    /// Read and parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }
}

fn default_listen() -> String {
    "0.0.0.0:9999".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    1500
}

fn default_event_capacity() -> usize {
    1024
}

fn default_read_chunk_size() -> usize {
    16 * 1024
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub poll_timeout: Duration,
    pub event_capacity: usize,
    pub read_chunk_size: usize,
    pub flush: FlushPolicy,
    pub max_body_size: usize,
    pub resync: ResyncPolicy,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = match cli.config {
            Some(ref config_path) => TomlConfig::from_file(config_path)?,
            None => TomlConfig::default(),
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            poll_timeout: Duration::from_millis(
                cli.poll_timeout_ms
                    .unwrap_or(toml_config.runtime.poll_timeout_ms),
            ),
            event_capacity: toml_config.runtime.event_capacity,
            read_chunk_size: toml_config.runtime.read_chunk_size,
            flush: cli.flush.unwrap_or(toml_config.runtime.flush),
            max_body_size: cli
                .max_body_size
                .unwrap_or(toml_config.framing.max_body_size),
            resync: cli.resync.unwrap_or(toml_config.framing.resync),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid("poll_timeout_ms must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be non-zero"));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("read_chunk_size must be non-zero"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be non-zero"));
        }
        if self.max_body_size > MAX_BODY_SIZE_LIMIT {
            return Err(ConfigError::Invalid(
                "max_body_size plus the frame header must fit in 32 bits",
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
