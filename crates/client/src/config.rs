//! Configuration management for the ichibot client.
//!
//! TOML configuration for the client, with environment and CLI overrides.
//! The default configuration path is `~/.config/ichibot/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Exchange;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default command server.
pub const DEFAULT_SERVER_URL: &str = "wss://beta.ichibot.trade:443";

/// Problems found by [`Config::validate`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("server url must start with ws:// or wss://, got {0}")]
    InvalidServerUrl(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{name} must be greater than 0")]
    ZeroInterval { name: &'static str },

    #[error("reset_interval_ms ({reset}) must not be shorter than ping_interval_ms ({ping})")]
    ResetShorterThanPing { ping: u64, reset: u64 },

    #[error("backoff_multiplier must be at least 1.0, got {0}")]
    InvalidBackoffMultiplier(f64),

    #[error("max_backoff_ms ({max}) must not be shorter than initial_backoff_ms ({initial})")]
    InvalidBackoffRange { initial: u64, max: u64 },

    #[error("unknown exchange in [server.endpoints]: {0}")]
    UnknownEndpointExchange(String),
}

/// Accepted `log_level` values.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the ichibot client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Local client behaviour.
    pub client: ClientConfig,

    /// Where to connect.
    pub server: ServerConfig,

    /// Liveness and reconnection tuning.
    pub connection: ConnectionConfig,
}

/// Local client behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory holding the credential database and init scripts.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Diagnostics go here instead of stderr when set.
    pub log_file: Option<PathBuf>,

    /// Show server `debug` feeds and send `debug: true` with commands.
    pub debug: bool,

    /// Prefix console output with timestamps.
    pub timestamps: bool,
}

/// Server endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Endpoint used for exchanges without an override.
    pub url: String,

    /// Also pass the exchange as `?exchange=` on the connection URL.
    pub exchange_query_param: bool,

    /// Per-exchange endpoint overrides, keyed by exchange label.
    pub endpoints: BTreeMap<String, String>,
}

/// How liveness probes are sent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PingMode {
    /// WebSocket ping control frame.
    Frame,
    /// Application-level text message (`ping_message`).
    Message,
}

/// Liveness and reconnection tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Interval between liveness probes.
    pub ping_interval_ms: u64,

    /// Silence longer than this forces a reconnect.
    pub reset_interval_ms: u64,

    pub ping_mode: PingMode,

    /// Text sent when `ping_mode = "message"`.
    pub ping_message: String,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    pub backoff_multiplier: f64,

    /// Upper bound on waiting for a close to be confirmed.
    pub close_timeout_ms: u64,

    /// Interval of the informational `poke` call.
    pub poke_interval_ms: u64,

    /// How long `login` waits for the handshake.
    pub login_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "warn".to_string(),
            log_file: None,
            debug: false,
            timestamps: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVER_URL.to_string(),
            exchange_query_param: true,
            endpoints: BTreeMap::new(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 10_000,
            reset_interval_ms: 60_000,
            ping_mode: PingMode::Message,
            ping_message: "ping".to_string(),
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 1.5,
            close_timeout_ms: 2_000,
            poke_interval_ms: 5_000,
            login_timeout_ms: 15_000,
        }
    }
}

impl ServerConfig {
    /// Endpoint for `exchange`: its override, else the default url.
    pub fn endpoint_for(&self, exchange: Exchange) -> &str {
        self.endpoints
            .get(exchange.as_str())
            .map(String::as_str)
            .unwrap_or(&self.url)
    }
}

impl ConnectionConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_millis(self.reset_interval_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn poke_interval(&self) -> Duration {
        Duration::from_millis(self.poke_interval_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }
}

/// `~/.config/ichibot/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ichibot")
        .join("config.toml")
}

/// Local data directory for the credential database and init scripts.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ichibot")
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn is_ws_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

impl Config {
    /// Applies `ICHIBOT_*` environment overrides.
    ///
    /// They win over the file; empty values are ignored.
    /// Supported variables:
    /// - ICHIBOT_SERVER_URL: Override the default server URL
    /// - ICHIBOT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - ICHIBOT_DEBUG: Enable debug mode when truthy
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("ICHIBOT_SERVER_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding server url from environment: {}", url);
                self.server.url = url;
            }
        }

        if let Ok(level) = std::env::var("ICHIBOT_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.client.log_level = level;
            }
        }

        if let Ok(debug) = std::env::var("ICHIBOT_DEBUG") {
            if !debug.is_empty() {
                self.client.debug = is_truthy(&debug);
            }
        }
    }

    /// Checks URLs, the log level and the connection timings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_ws_url(&self.server.url) {
            return Err(ConfigError::InvalidServerUrl(self.server.url.clone()));
        }

        for (exchange, url) in &self.server.endpoints {
            if exchange.parse::<Exchange>().is_err() {
                return Err(ConfigError::UnknownEndpointExchange(exchange.clone()));
            }
            if !is_ws_url(url) {
                return Err(ConfigError::InvalidServerUrl(url.clone()));
            }
        }

        let level = self.client.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.client.log_level.clone()));
        }

        let conn = &self.connection;
        for (name, value) in [
            ("ping_interval_ms", conn.ping_interval_ms),
            ("reset_interval_ms", conn.reset_interval_ms),
            ("initial_backoff_ms", conn.initial_backoff_ms),
            ("close_timeout_ms", conn.close_timeout_ms),
            ("poke_interval_ms", conn.poke_interval_ms),
            ("login_timeout_ms", conn.login_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval { name });
            }
        }

        if conn.reset_interval_ms < conn.ping_interval_ms {
            return Err(ConfigError::ResetShorterThanPing {
                ping: conn.ping_interval_ms,
                reset: conn.reset_interval_ms,
            });
        }

        if !(conn.backoff_multiplier >= 1.0) {
            return Err(ConfigError::InvalidBackoffMultiplier(conn.backoff_multiplier));
        }

        if conn.max_backoff_ms < conn.initial_backoff_ms {
            return Err(ConfigError::InvalidBackoffRange {
                initial: conn.initial_backoff_ms,
                max: conn.max_backoff_ms,
            });
        }

        Ok(())
    }

    /// Reads `path`.
    ///
    /// A missing file yields the defaults.
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

    /// Reads [`default_config_path`].
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parses TOML text; missing sections and keys take defaults.
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

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// TOML error message with the byte span, when known.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
