//! # Teensy Telemetry Library
//!
//! Stream telemetry from a Teensy sensor board over USB serial.
//!
//! This library provides the serial ingestion pipeline: finding the board among
//! the host's serial ports, reading its comma-separated telemetry lines in the
//! background, and publishing parsed records to a single consumer through an
//! [`IngestionSession`](session::IngestionSession).

pub mod config;
pub mod error;
pub mod serial;
pub mod session;
pub mod telemetry;
