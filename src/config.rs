//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TelemetryError};
use crate::serial::LinkSettings;
use crate::session::SessionSettings;

/// Baud rates accepted in `[serial].baud_rate`
const SUPPORTED_BAUD_RATES: &[u32] = &[9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600];

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Explicit candidate ports, tried in order. Empty means enumerate the host.
    #[serde(default)]
    pub ports: Vec<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Session and console consumer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub reconnect: bool,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_output")]
    pub output: String,
}

// Default value functions
fn default_baud_rate() -> u32 { 115200 }
fn default_open_timeout_ms() -> u64 { 1000 }
fn default_poll_interval_ms() -> u64 { 20 }

fn default_shutdown_grace_ms() -> u64 { 500 }
fn default_reconnect_interval_ms() -> u64 { 2000 }
fn default_output() -> String { "text".to_string() }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            baud_rate: default_baud_rate(),
            open_timeout_ms: default_open_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace_ms(),
            reconnect: false,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            output: default_output(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use teensy_telemetry::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Serial parameters used for every open attempt
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            baud_rate: self.serial.baud_rate,
            open_timeout: Duration::from_millis(self.serial.open_timeout_ms),
        }
    }

    /// Timing parameters for the ingestion session
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            poll_interval: Duration::from_millis(self.serial.poll_interval_ms),
            shutdown_grace: Duration::from_millis(self.session.shutdown_grace_ms),
        }
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.serial.ports.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("serial ports cannot contain empty names"));
        }

        if !SUPPORTED_BAUD_RATES.contains(&self.serial.baud_rate) {
            return Err(invalid(format!(
                "baud_rate must be one of: {}",
                SUPPORTED_BAUD_RATES
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        if self.serial.open_timeout_ms == 0 || self.serial.open_timeout_ms > 10000 {
            return Err(invalid("open_timeout_ms must be between 1 and 10000"));
        }

        if self.serial.poll_interval_ms == 0 || self.serial.poll_interval_ms > 1000 {
            return Err(invalid("poll_interval_ms must be between 1 and 1000"));
        }

        if self.session.shutdown_grace_ms == 0 || self.session.shutdown_grace_ms > 10000 {
            return Err(invalid("shutdown_grace_ms must be between 1 and 10000"));
        }

        if self.session.reconnect_interval_ms == 0 || self.session.reconnect_interval_ms > 60000 {
            return Err(invalid("reconnect_interval_ms must be between 1 and 60000"));
        }

        if !["text", "jsonl"].contains(&self.session.output.as_str()) {
            return Err(invalid("output must be 'text' or 'jsonl'"));
        }

        Ok(())
    }
}

fn invalid(msg: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::Config(toml::de::Error::custom(msg))
}
