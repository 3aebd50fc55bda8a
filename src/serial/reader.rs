//! # Link Reader
//!
//! Background read loop that turns the board's line stream into records.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::Link;
use crate::telemetry::parser::{decode_line, parse_record};
use crate::telemetry::TelemetryRecord;

/// How long the loop pauses after a read that ended without a newline
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Longest line kept while waiting for its newline; longer runs are dropped
pub const MAX_LINE_LENGTH: usize = 4096;

/// Reported when the device hangs up, e.g. after it was unplugged
pub const END_OF_STREAM: &str = "device disconnected (end of stream)";

/// Output of the read loop, in the order it was produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// Sent once, just before the first record of the link
    FirstData,

    /// A successfully parsed line
    Record(TelemetryRecord),

    /// The link failed; it is already closed when this is sent
    Failed(String),
}

/// How the read loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReaderExit {
    Stopped,
    Failed(String),
}

/// Streams records from an open [`Link`] until stopped or the link fails
///
/// The reader owns the link while it runs and hands it back, closed, when
/// [`run`](LinkReader::run) returns. Failed reads are not retried.
#[derive(Debug)]
pub struct LinkReader {
    link: Link,
    poll_interval: Duration,
    stop: watch::Receiver<bool>,
}

impl LinkReader {
    /// Create a reader for `link`
    ///
    /// The loop stops once `true` is sent on `stop`, or when the sender is dropped.
    pub fn new(link: Link, poll_interval: Duration, stop: watch::Receiver<bool>) -> Self {
        Self {
            link,
            poll_interval,
            stop,
        }
    }

    /// Run the read loop
    ///
    /// Each complete line is decoded, parsed, and forwarded as
    /// [`ReaderEvent::Record`]; lines that are not records are skipped. On an
    /// I/O error or end of stream the link is closed first, then
    /// [`ReaderEvent::Failed`] is sent. The link is closed on every exit path.
    pub async fn run(mut self, events: mpsc::UnboundedSender<ReaderEvent>) -> Link {
        let exit = self.read_loop(&events).await;
        self.link.close();

        match exit {
            ReaderExit::Stopped => {
                info!("Stopped reading from {}", self.link.port_name());
            }
            ReaderExit::Failed(reason) => {
                warn!("Serial link on {} failed: {}", self.link.port_name(), reason);
                // Receiver may already be gone
                let _ = events.send(ReaderEvent::Failed(reason));
            }
        }

        self.link
    }

    async fn read_loop(&mut self, events: &mpsc::UnboundedSender<ReaderEvent>) -> ReaderExit {
        let Self {
            link,
            poll_interval,
            stop,
        } = self;
        let port_name = link.port_name().to_string();
        let Some(stream) = link.stream_mut() else {
            return ReaderExit::Failed("link already closed".to_string());
        };

        let mut first_data_sent = false;
        let mut buf = Vec::new();

        loop {
            if *stop.borrow() {
                return ReaderExit::Stopped;
            }

            // `buf` stays below MAX_LINE_LENGTH, so the limit is never zero
            let remaining = (MAX_LINE_LENGTH - buf.len()) as u64;
            let mut limited = (&mut *stream).take(remaining);

            // read_until keeps partial bytes in `buf` if the stop branch wins
            let read = tokio::select! {
                biased;
                _ = stop.changed() => return ReaderExit::Stopped,
                read = limited.read_until(b'\n', &mut buf) => read,
            };

            match read {
                // A serial read waits for data, so zero bytes means hang-up
                Ok(0) => {
                    if *stop.borrow() {
                        return ReaderExit::Stopped;
                    }
                    return ReaderExit::Failed(END_OF_STREAM.to_string());
                }
                Ok(_) if buf.ends_with(b"\n") => {
                    let line = decode_line(&buf);
                    match parse_record(&line) {
                        Some(record) => {
                            if !first_data_sent {
                                info!("Receiving telemetry from {}", port_name);
                                let _ = events.send(ReaderEvent::FirstData);
                                first_data_sent = true;
                            }
                            let _ = events.send(ReaderEvent::Record(record));
                        }
                        None => debug!("Skipping non-record line: {:?}", line),
                    }
                    buf.clear();
                }
                Ok(_) if buf.len() >= MAX_LINE_LENGTH => {
                    warn!(
                        "Dropping {} bytes from {} without a line break",
                        buf.len(),
                        port_name
                    );
                    buf.clear();
                }
                // Partial line; the next read either completes it or hits end of stream
                Ok(_) => {
                    tokio::select! {
                        biased;
                        _ = stop.changed() => return ReaderExit::Stopped,
                        _ = tokio::time::sleep(*poll_interval) => {}
                    }
                }
                Err(e) => {
                    if *stop.borrow() {
                        return ReaderExit::Stopped;
                    }
                    return ReaderExit::Failed(e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::LinkSettings;
    use std::io;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;
    use tokio_test::io::Builder;

    const LINE_A: &[u8] = b"2024-01-01,12:00:00,8,40.0,-75.0,100,0.1,0.2,9.8,10,20,30,0.01,0.02,0.03,25.0\r\n";
    const LINE_B: &[u8] = b"2024-01-01,12:00:01,9,40.1,-75.1,101,0.1,0.2,9.7,11,21,31,0.01,0.02,0.03,25.1\r\n";
    const LINE_C: &[u8] = b"2024-01-01,12:00:02,9,40.2,-75.2,102,0.1,0.2,9.6,12,22,32,0.01,0.02,0.03,25.2\r\n";

    const POLL: Duration = Duration::from_millis(5);
    const WAIT: Duration = Duration::from_secs(2);

    fn link_from(builder: &mut Builder) -> Link {
        Link::new("/dev/ttyTEST", LinkSettings::default(), Box::new(builder.build()))
    }

    /// Link that stays open and silent until the returned device half writes or drops
    fn live_link() -> (Link, DuplexStream) {
        let (device, host) = duplex(8192);
        let link = Link::new("/dev/ttyTEST", LinkSettings::default(), Box::new(host));
        (link, device)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ReaderEvent>) -> ReaderEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for reader event")
            .expect("reader channel closed")
    }

    fn record_time(event: &ReaderEvent) -> &str {
        match event {
            ReaderEvent::Record(record) => &record.time,
            other => panic!("Expected Record, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_records_in_order_after_single_first_data() {
        let (link, mut device) = live_link();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(LinkReader::new(link, POLL, stop_rx).run(tx));
        for line in [LINE_A, LINE_B, LINE_C] {
            device.write_all(line).await.unwrap();
        }

        assert_eq!(next(&mut rx).await, ReaderEvent::FirstData);
        assert_eq!(record_time(&next(&mut rx).await), "12:00:00");
        assert_eq!(record_time(&next(&mut rx).await), "12:00:01");
        assert_eq!(record_time(&next(&mut rx).await), "12:00:02");

        stop_tx.send(true).unwrap();
        let link = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(link.is_closed());

        // Nothing but the stop remains: no second FirstData, no Failed
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let link = link_from(
            Builder::new()
                .read(b"garbage\r\n")
                .read(b"1,2,3\n")
                .read(LINE_A),
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(LinkReader::new(link, POLL, stop_rx).run(tx));

        assert_eq!(next(&mut rx).await, ReaderEvent::FirstData);
        assert_eq!(record_time(&next(&mut rx).await), "12:00:00");
    }

    #[tokio::test]
    async fn test_garbage_on_silent_link_sends_nothing() {
        let (link, mut device) = live_link();
        let status = link.status();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(LinkReader::new(link, POLL, stop_rx).run(tx));
        device.write_all(b"garbage\n").await.unwrap();

        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        assert!(!status.is_closed());

        stop_tx.send(true).unwrap();
        timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(status.is_closed());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_line_split_across_reads() {
        let (head, tail) = LINE_A.split_at(20);
        let link = link_from(Builder::new().read(head).read(tail));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(LinkReader::new(link, POLL, stop_rx).run(tx));

        assert_eq!(next(&mut rx).await, ReaderEvent::FirstData);
        assert_eq!(record_time(&next(&mut rx).await), "12:00:00");
    }

    #[tokio::test]
    async fn test_invalid_bytes_are_discarded() {
        let mut noisy = vec![0xff, 0xfe];
        noisy.extend_from_slice(LINE_A);
        let link = link_from(Builder::new().read(&noisy));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(LinkReader::new(link, POLL, stop_rx).run(tx));

        assert_eq!(next(&mut rx).await, ReaderEvent::FirstData);
        match next(&mut rx).await {
            ReaderEvent::Record(record) => assert_eq!(record.date, "2024-01-01"),
            other => panic!("Expected Record, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overlong_line_is_dropped() {
        let (link, mut device) = live_link();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(LinkReader::new(link, POLL, stop_rx).run(tx));

        // Noise without a newline, longer than one line may be
        let noise = vec![b'x'; MAX_LINE_LENGTH + 100];
        device.write_all(&noise).await.unwrap();
        device.write_all(b"\n").await.unwrap();
        device.write_all(LINE_A).await.unwrap();

        assert_eq!(next(&mut rx).await, ReaderEvent::FirstData);
        match next(&mut rx).await {
            ReaderEvent::Record(record) => assert_eq!(record.date, "2024-01-01"),
            other => panic!("Expected Record, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_end_of_stream_closes_link_then_reports() {
        let link = Link::new("/dev/ttyTEST", LinkSettings::default(), Box::new(tokio::io::empty()));
        let status = link.status();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(LinkReader::new(link, POLL, stop_rx).run(tx));

        assert_eq!(next(&mut rx).await, ReaderEvent::Failed(END_OF_STREAM.to_string()));
        assert!(status.is_closed());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_device_hangup_after_records() {
        let (link, mut device) = live_link();
        let status = link.status();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(LinkReader::new(link, POLL, stop_rx).run(tx));
        device.write_all(LINE_A).await.unwrap();
        // Partial line, then the device goes away
        device.write_all(&LINE_B[..10]).await.unwrap();
        drop(device);

        assert_eq!(next(&mut rx).await, ReaderEvent::FirstData);
        assert_eq!(record_time(&next(&mut rx).await), "12:00:00");
        assert_eq!(next(&mut rx).await, ReaderEvent::Failed(END_OF_STREAM.to_string()));
        assert!(status.is_closed());
    }

    #[tokio::test]
    async fn test_io_error_after_records_closes_link_then_reports() {
        let link = link_from(
            Builder::new()
                .read(LINE_A)
                .read(LINE_B)
                .read_error(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")),
        );
        let status = link.status();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(LinkReader::new(link, POLL, stop_rx).run(tx));

        assert_eq!(next(&mut rx).await, ReaderEvent::FirstData);
        assert_eq!(record_time(&next(&mut rx).await), "12:00:00");
        assert_eq!(record_time(&next(&mut rx).await), "12:00:01");

        match next(&mut rx).await {
            ReaderEvent::Failed(reason) => assert!(reason.contains("device unplugged")),
            other => panic!("Expected Failed, got: {:?}", other),
        }
        assert!(status.is_closed(), "link must be closed before Failed is delivered");

        // Exactly one terminal event
        assert!(rx.recv().await.is_none());
        assert!(handle.await.unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_error_before_data_sends_only_failed() {
        let link = link_from(
            Builder::new().read_error(io::Error::new(io::ErrorKind::Other, "read failed")),
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(LinkReader::new(link, POLL, stop_rx).run(tx));

        assert!(matches!(next(&mut rx).await, ReaderEvent::Failed(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_on_silent_link_within_poll_interval() {
        let poll = Duration::from_millis(50);
        let (link, _device) = live_link();
        let status = link.status();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(LinkReader::new(link, poll, stop_rx).run(tx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!status.is_closed());

        stop_tx.send(true).unwrap();
        timeout(poll, handle).await.unwrap().unwrap();
        assert!(status.is_closed());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_stop_sender_stops_reader() {
        let (link, _device) = live_link();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(LinkReader::new(link, POLL, stop_rx).run(tx));
        drop(stop_tx);

        let link = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(link.is_closed());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_link_fails_immediately() {
        let mut link = link_from(&mut Builder::new());
        link.close();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        LinkReader::new(link, POLL, stop_rx).run(tx).await;

        assert_eq!(
            rx.recv().await,
            Some(ReaderEvent::Failed("link already closed".to_string()))
        );
    }
}
