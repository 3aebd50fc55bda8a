//! # Ingestion Session
//!
//! State machine that the consumer drives with `start`/`stop` and observes
//! through a single ordered event queue.
//!
//! ```text
//! Idle --start--> Connecting --first record--> Live
//!   ^                 |                          |
//!   +---- Disconnected / stop -------------------+
//! ```
//!
//! A session never jumps from Idle to Live: a port that opens but never
//! produces a parseable line stays in Connecting.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TelemetryError};
use crate::serial::reader::{LinkReader, ReaderEvent, DEFAULT_POLL_INTERVAL};
use crate::serial::{ConnectionManager, Link, LinkStatus};
use crate::telemetry::TelemetryRecord;

/// Default time to wait for a stopped reader before aborting it
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Where the session is in its lifecycle
///
/// Failures fold straight back to `Idle` once the consumer has been told,
/// so there is no separate faulted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No link, no reader
    Idle,

    /// Link open and reader running, no record seen yet
    Connecting,

    /// Records are flowing
    Live,
}

/// Events delivered to the consumer, in the order the reader produced them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The link produced its first record. Precedes that record's `RecordReceived`.
    FirstDataReceived,

    RecordReceived(TelemetryRecord),

    /// The link failed and has been closed; the session is Idle again
    Disconnected(String),
}

/// Session timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Read loop pause after a partial line; also bounds how long a stop takes
    pub poll_interval: Duration,

    /// Upper bound on waiting for a stopped reader before the next start
    pub shutdown_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// The running half of a session
struct ActiveLink {
    port_name: String,
    status: LinkStatus,
    stop: watch::Sender<bool>,
    events: mpsc::UnboundedReceiver<ReaderEvent>,
    reader: JoinHandle<Link>,
}

/// The single monitoring session for the sensor board
///
/// Owned by whatever issues start/stop commands. Events come out of
/// [`next_event`](IngestionSession::next_event), which also applies the
/// state transitions, so state and delivered events never disagree.
pub struct IngestionSession {
    manager: ConnectionManager,
    settings: SessionSettings,
    state: SessionState,
    active: Option<ActiveLink>,
    /// Reader that was stopped or failed but may not have exited yet
    retiring: Option<JoinHandle<Link>>,
}

impl std::fmt::Debug for IngestionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionSession")
            .field("state", &self.state)
            .field("port_name", &self.port_name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl IngestionSession {
    pub fn new(manager: ConnectionManager, settings: SessionSettings) -> Self {
        Self {
            manager,
            settings,
            state: SessionState::Idle,
            active: None,
            retiring: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Port of the current link, if any
    pub fn port_name(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.port_name.as_str())
    }

    /// Closed-flag observer of the current link, if any
    pub fn link_status(&self) -> Option<LinkStatus> {
        self.active.as_ref().map(|a| a.status.clone())
    }

    /// Open the first available port and start reading from it
    ///
    /// Waits for any previous reader to exit first (bounded by the shutdown
    /// grace period), so two readers never share a port. On success the
    /// session is `Connecting`.
    ///
    /// # Errors
    ///
    /// - [`TelemetryError::SessionActive`] if the session is not Idle
    /// - [`TelemetryError::NoDeviceFound`] if no port opens; the session stays Idle
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(TelemetryError::SessionActive);
        }

        self.reap_retired_reader().await;

        let link = match self.manager.connect() {
            Ok(link) => link,
            Err(e) => {
                warn!("{}", e);
                return Err(e);
            }
        };

        let port_name = link.port_name().to_string();
        let status = link.status();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader = LinkReader::new(link, self.settings.poll_interval, stop_rx);
        let handle = tokio::spawn(reader.run(events_tx));

        info!("Session connecting on {}", port_name);
        self.active = Some(ActiveLink {
            port_name,
            status,
            stop: stop_tx,
            events: events_rx,
            reader: handle,
        });
        self.state = SessionState::Connecting;
        Ok(())
    }

    /// Ask the reader to stop and return to Idle
    ///
    /// Does not wait for the reader; it closes the link within one poll
    /// interval. Events still queued from the stopped link are discarded.
    /// No-op when Idle.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        info!("Stopping session on {}", active.port_name);
        // Reader also stops when the sender is dropped
        let _ = active.stop.send(true);
        self.retiring = Some(active.reader);
        self.state = SessionState::Idle;
    }

    /// Stop and wait until the reader has exited and the link is released
    pub async fn shutdown(&mut self) {
        self.stop();
        self.reap_retired_reader().await;
    }

    /// Next event from the current link
    ///
    /// Returns `None` immediately while Idle. Cancel safe, so it can be used
    /// as a `tokio::select!` branch.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let active = self.active.as_mut()?;

        match active.events.recv().await {
            Some(ReaderEvent::FirstData) => {
                info!("First data received on {}", active.port_name);
                self.state = SessionState::Live;
                Some(SessionEvent::FirstDataReceived)
            }
            Some(ReaderEvent::Record(record)) => Some(SessionEvent::RecordReceived(record)),
            Some(ReaderEvent::Failed(reason)) => {
                self.retire_failed_link();
                Some(SessionEvent::Disconnected(reason))
            }
            // Reader went away without reporting, e.g. it panicked
            None => {
                self.retire_failed_link();
                Some(SessionEvent::Disconnected("link reader exited unexpectedly".to_string()))
            }
        }
    }

    fn retire_failed_link(&mut self) {
        if let Some(active) = self.active.take() {
            warn!("Session on {} disconnected", active.port_name);
            self.retiring = Some(active.reader);
        }
        self.state = SessionState::Idle;
    }

    /// Wait for the last reader to hand its link back, then release it
    async fn reap_retired_reader(&mut self) {
        let Some(mut handle) = self.retiring.take() else {
            return;
        };

        match tokio::time::timeout(self.settings.shutdown_grace, &mut handle).await {
            Ok(Ok(mut link)) => self.manager.release(&mut link),
            Ok(Err(e)) => warn!("Link reader ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "Link reader did not stop within {:?}, aborting",
                    self.settings.shutdown_grace
                );
                // Dropping the aborted task drops and closes its link
                handle.abort();
                if let Err(e) = handle.await {
                    debug!("Aborted link reader: {}", e);
                }
            }
        }
    }
}

impl Drop for IngestionSession {
    fn drop(&mut self) {
        self.stop();
    }
}
