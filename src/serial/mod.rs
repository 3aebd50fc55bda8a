//! # Serial Communication Module
//!
//! Handles the USB serial link to the sensor board.
//!
//! This module handles:
//! - Discovering candidate ports
//! - Trying candidates in order and keeping the first one that opens
//! - Owning the open link and closing it exactly once
//! - Reading telemetry lines from the link (see [`reader`])

pub mod port_trait;
pub mod reader;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tracing::{debug, info, warn};

use crate::error::{Result, TelemetryError};
use port_trait::{LinkStream, PortEnumerator, PortOpener, SystemPorts, TokioSerialOpener};

/// Baud rate the sensor board firmware streams at
pub const TELEMETRY_BAUD_RATE: u32 = 115_200;

/// Timeout applied to each attempt to open a candidate port
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(1);

/// Serial parameters applied to every open attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub baud_rate: u32,
    pub open_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: TELEMETRY_BAUD_RATE,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

/// Shared view of whether a [`Link`] has been closed
///
/// Cheap to clone; every clone observes the same link.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus(Arc<AtomicBool>);

impl LinkStatus {
    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn mark_closed(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// One open serial connection to the board
///
/// Closing is idempotent, and dropping a link closes it.
pub struct Link {
    port_name: String,
    settings: LinkSettings,
    stream: Option<BufReader<LinkStream>>,
    status: LinkStatus,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("port_name", &self.port_name)
            .field("settings", &self.settings)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Wrap an already opened stream
    pub fn new(port_name: impl Into<String>, settings: LinkSettings, stream: LinkStream) -> Self {
        Self {
            port_name: port_name.into(),
            settings,
            stream: Some(BufReader::new(stream)),
            status: LinkStatus::default(),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// Observer for the closed flag that outlives moves of the link
    pub fn status(&self) -> LinkStatus {
        self.status.clone()
    }

    /// Buffered stream, or `None` once closed
    pub(crate) fn stream_mut(&mut self) -> Option<&mut BufReader<LinkStream>> {
        self.stream.as_mut()
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&mut self) {
        // Dropping the stream releases the OS handle
        self.stream.take();
        if self.status.mark_closed() {
            debug!("Closed serial link on {}", self.port_name);
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

/// Finds the board among candidate ports and owns link teardown
pub struct ConnectionManager {
    enumerator: Box<dyn PortEnumerator>,
    opener: Box<dyn PortOpener>,
    settings: LinkSettings,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(
        enumerator: Box<dyn PortEnumerator>,
        opener: Box<dyn PortOpener>,
        settings: LinkSettings,
    ) -> Self {
        Self {
            enumerator,
            opener,
            settings,
        }
    }

    /// Manager that tries every port the OS reports
    pub fn system(settings: LinkSettings) -> Self {
        Self::new(Box::new(SystemPorts), Box::new(TokioSerialOpener), settings)
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Current candidate ports, in enumeration order
    pub fn list_ports(&self) -> Vec<String> {
        self.enumerator.list_ports()
    }

    /// Enumerate candidates and open the first port that accepts a connection
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NoDeviceFound`] if no candidate opens
    pub fn connect(&self) -> Result<Link> {
        let ports = self.list_ports();
        self.acquire_link(&ports)
    }

    /// Try each candidate in order; the first successful open wins
    ///
    /// Ports after the winner are never touched. An empty candidate list
    /// fails without any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NoDeviceFound`] listing the tried ports if
    /// every candidate fails to open
    pub fn acquire_link<S: AsRef<str>>(&self, candidates: &[S]) -> Result<Link> {
        for port in candidates {
            let port = port.as_ref();
            debug!("Trying to open serial port: {}", port);

            match self.opener.open(port, &self.settings) {
                Ok(stream) => {
                    info!("Opened serial port {} at {} baud", port, self.settings.baud_rate);
                    return Ok(Link::new(port, self.settings, stream));
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", port, e);
                    continue;
                }
            }
        }

        let tried: Vec<&str> = candidates.iter().map(|p| p.as_ref()).collect();
        Err(TelemetryError::NoDeviceFound(if tried.is_empty() {
            "no candidate ports".to_string()
        } else {
            tried.join(", ")
        }))
    }

    /// Close a link. Safe on links that are already closed.
    pub fn release(&self, link: &mut Link) {
        if !link.is_closed() {
            info!("Releasing serial link on {}", link.port_name());
        }
        link.close();
    }
}
