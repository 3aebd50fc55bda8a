//! # Teensy Telemetry
//!
//! Live console monitor for a Teensy 4.1 sensor board.
//!
//! Finds the board among the host's serial ports, waits until it actually
//! streams telemetry, then prints every record as it arrives.
//!
//! # Examples
//!
//! ```bash
//! teensy-telemetry                      # try every serial port
//! teensy-telemetry --port /dev/ttyACM0  # try only this port
//! teensy-telemetry --list-ports
//! teensy-telemetry --config monitor.toml --jsonl
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use teensy_telemetry::config::Config;
use teensy_telemetry::error::TelemetryError;
use teensy_telemetry::serial::port_trait::{FixedPorts, TokioSerialOpener};
use teensy_telemetry::serial::ConnectionManager;
use teensy_telemetry::session::{IngestionSession, SessionEvent, SessionState};
use teensy_telemetry::telemetry::TelemetryRecord;

/// Live monitor for Teensy sensor board telemetry
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Candidate serial port, tried in the given order (repeatable)
    #[arg(short, long = "port", value_name = "PORT")]
    ports: Vec<String>,

    /// Print the candidate ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Print records as JSON Lines
    #[arg(long)]
    jsonl: bool,
}

/// How records are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    JsonLines,
}

/// One JSON Lines output row
#[derive(Serialize)]
struct JsonLine<'a> {
    received_at: String,
    #[serde(flatten)]
    record: &'a TelemetryRecord,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!("Teensy Telemetry v{} starting...", env!("CARGO_PKG_VERSION"));

    let manager = build_manager(&config);

    if cli.list_ports {
        let ports = manager.list_ports();
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            println!("{}", port);
        }
        return Ok(());
    }

    let output = if config.session.output == "jsonl" {
        OutputFormat::JsonLines
    } else {
        OutputFormat::Text
    };

    let mut session = IngestionSession::new(manager, config.session_settings());
    run(&mut session, &config, output).await
}

/// Merge the config file (if any) with command line overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if !cli.ports.is_empty() {
        config.serial.ports = cli.ports.clone();
    }
    if cli.jsonl {
        config.session.output = "jsonl".to_string();
    }

    config.validate()?;
    Ok(config)
}

fn build_manager(config: &Config) -> ConnectionManager {
    if config.serial.ports.is_empty() {
        ConnectionManager::system(config.link_settings())
    } else {
        ConnectionManager::new(
            Box::new(FixedPorts(config.serial.ports.clone())),
            Box::new(TokioSerialOpener),
            config.link_settings(),
        )
    }
}

/// Drive the session until Ctrl+C, or until the link is lost without reconnect
async fn run(session: &mut IngestionSession, config: &Config, output: OutputFormat) -> Result<()> {
    let reconnect_interval = Duration::from_millis(config.session.reconnect_interval_ms);
    let mut records: u64 = 0;

    loop {
        if session.state() == SessionState::Idle {
            let Some(started) = start_unless(session, tokio::signal::ctrl_c()).await else {
                info!("Received Ctrl+C, shutting down...");
                session.shutdown().await;
                break;
            };

            match started {
                Ok(()) => {
                    info!(
                        "Waiting for telemetry on {}",
                        session.port_name().unwrap_or("?")
                    );
                }
                Err(TelemetryError::NoDeviceFound(tried)) => {
                    eprintln!("No USB stream found (tried: {})", tried);
                    if !config.session.reconnect {
                        bail!("no device found");
                    }
                    if !wait_before_reconnect(reconnect_interval).await {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        tokio::select! {
            event = session.next_event() => match event {
                Some(SessionEvent::FirstDataReceived) => {
                    println!("Live telemetry from {}", session.port_name().unwrap_or("?"));
                }
                Some(SessionEvent::RecordReceived(record)) => {
                    records += 1;
                    println!("{}", render_record(&record, output)?);
                }
                Some(SessionEvent::Disconnected(reason)) => {
                    eprintln!("Device disconnected or serial error occurred: {}", reason);
                    if !config.session.reconnect {
                        bail!("device disconnected");
                    }
                    if !wait_before_reconnect(reconnect_interval).await {
                        break;
                    }
                }
                None => {}
            },

            // Handle Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                session.shutdown().await;
                break;
            }
        }
    }

    info!("Total records received: {}", records);
    Ok(())
}

/// Start the session, or give up with `None` once `interrupt` completes
///
/// `start()` may wait out the shutdown grace of the previous reader first.
async fn start_unless<F>(session: &mut IngestionSession, interrupt: F) -> Option<Result<(), TelemetryError>>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = interrupt => None,
        started = session.start() => Some(started),
    }
}

/// Sleep before the next start attempt. Returns `false` on Ctrl+C.
async fn wait_before_reconnect(interval: Duration) -> bool {
    info!("Retrying in {:?}", interval);
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received Ctrl+C while waiting to reconnect");
            false
        }
    }
}

fn render_record(record: &TelemetryRecord, output: OutputFormat) -> Result<String> {
    match output {
        OutputFormat::Text => Ok(format_record(record)),
        OutputFormat::JsonLines => {
            let line = JsonLine {
                received_at: chrono::Local::now().to_rfc3339(),
                record,
            };
            Ok(serde_json::to_string(&line)?)
        }
    }
}

/// Human-readable rendering of one record
fn format_record(record: &TelemetryRecord) -> String {
    let fix = if record.has_gps_fix() { "Fix Acquired" } else { "No Fix" };
    let [ax, ay, az] = &record.acceleration;
    let [mx, my, mz] = &record.magnetic_field;
    let [gx, gy, gz] = &record.angular_velocity;

    format!(
        "{} {} | GPS: {} ({} sats) lat {} lon {} elev {} m | \
         acc m/s² X {} Y {} Z {} | mag uT X {} Y {} Z {} | \
         gyro rad/s X {} Y {} Z {} | temp {} °C",
        record.date,
        record.time,
        fix,
        record.satellite_count,
        record.latitude,
        record.longitude,
        record.altitude,
        ax,
        ay,
        az,
        mx,
        my,
        mz,
        gx,
        gy,
        gz,
        record.temperature,
    )
}
