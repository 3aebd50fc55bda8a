//! # Error Types
//!
//! Custom error types for Teensy Telemetry using `thiserror`.

use thiserror::Error;

/// Main error type for Teensy Telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// None of the candidate ports could be opened
    #[error("No device found (tried: {0})")]
    NoDeviceFound(String),

    /// Serial port errors
    #[error("Serial error: {0}")]
    Serial(String),

    /// A session is already connecting or live
    #[error("Session already active")]
    SessionActive,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Teensy Telemetry
pub type Result<T> = std::result::Result<T, TelemetryError>;
