//! Configuration management for classroom-rtc

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name used in signaling frames when the caller supplies none
pub const FALLBACK_DISPLAY_NAME: &str = "Unknown User";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Signaling hub configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Session coordinator configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Signaling hub connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Hub endpoint (http/https are mapped to ws/wss)
    #[serde(default = "default_signaling_url")]
    pub url: String,

    /// Timeout for socket open and protocol handshake, in seconds
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Keepalive ping interval, in seconds
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Delay before each reconnect attempt, in milliseconds
    #[serde(default = "default_reconnect_delays_ms")]
    pub reconnect_delays_ms: Vec<u64>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            reconnect_delays_ms: default_reconnect_delays_ms(),
        }
    }
}

/// Session coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Buffered events per subscriber before slow subscribers start lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Display name announced to peers when none is given
    #[serde(default = "default_display_name")]
    pub default_display_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            default_display_name: default_display_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level / env_logger filter
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let url = self.signaling.url.trim();
        if url.is_empty() {
            return Err("Signaling URL must not be empty".into());
        }
        if !["http://", "https://", "ws://", "wss://"].iter().any(|scheme| url.starts_with(scheme)) {
            return Err("Signaling URL must use http, https, ws or wss".into());
        }

        if self.signaling.handshake_timeout_secs == 0 {
            return Err("Signaling handshake timeout must be non-zero".into());
        }

        if self.signaling.keepalive_interval_secs == 0 {
            return Err("Signaling keepalive interval must be non-zero".into());
        }

        if self.session.event_capacity == 0 {
            return Err("Session event capacity must be non-zero".into());
        }

        if self.session.default_display_name.trim().is_empty() {
            return Err("Default display name must not be empty".into());
        }

        Ok(())
    }
}

fn default_signaling_url() -> String {
    "https://localhost:7145/hubs/signaling".to_string()
}

fn default_handshake_timeout_secs() -> u64 { 15 }
fn default_keepalive_interval_secs() -> u64 { 15 }
fn default_reconnect_delays_ms() -> Vec<u64> { vec![0, 2_000, 10_000, 30_000] }
fn default_event_capacity() -> usize { 256 }

fn default_display_name() -> String {
    FALLBACK_DISPLAY_NAME.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
