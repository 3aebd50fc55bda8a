//! # Telemetry Module
//!
//! Telemetry records produced by the sensor board.
//!
//! This module handles:
//! - The record type handed to the consumer, one per parsed line
//! - Parsing comma-separated lines into records (see [`parser`])
//! - Best-effort decoding of raw serial bytes into text

pub mod parser;

use serde::Serialize;

/// Three ordered axis readings (x, y, z), kept exactly as received
pub type Vector3 = [String; 3];

/// One parsed telemetry line
///
/// All values are the verbatim tokens of the wire line. No unit conversion or
/// range validation is applied; producing well-formed values is the board's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryRecord {
    /// GPS date as formatted by the board
    pub date: String,

    /// GPS time as formatted by the board
    pub time: String,

    /// Satellites in view. Numeric-looking, but may be `nan` before a fix.
    pub satellite_count: String,

    pub latitude: String,
    pub longitude: String,

    /// Elevation in meters
    pub altitude: String,

    /// Acceleration in m/s²
    pub acceleration: Vector3,

    /// Magnetic field in µT
    pub magnetic_field: Vector3,

    /// Angular velocity in rad/s
    pub angular_velocity: Vector3,

    /// Board temperature in °C
    pub temperature: String,
}

impl TelemetryRecord {
    /// Whether the GPS reports a position fix
    ///
    /// The board reports `0` or `nan` satellites while it has no fix.
    pub fn has_gps_fix(&self) -> bool {
        let sats = self.satellite_count.trim();
        sats != "0" && !sats.eq_ignore_ascii_case("nan")
    }
}
