//! RFID reader link over a line-oriented TCP protocol
//!
//! Protocol:
//! - Client sends a fixed poll command terminated by CRLF (default `READ`)
//! - Reader answers with one tag identifier per line
//! - Response ends with a line starting `OK>` (success) or `ERR>` (error)
//!
//! A read window that closes before a terminator arrives is a poll timeout,
//! which the driver treats as an empty cycle rather than a session failure.
//! The reply to the timed-out command is still owed, so the next poll first
//! discards it. When it has not fully arrived yet the session is reopened,
//! because a reply can never be attributed to the wrong command.

use crate::domain::types::TagId;
use crate::infra::config::{MonitorSettings, MonitorTimings};
use crate::io::simulator::SimulatedReader;
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Response terminator markers
pub const TERMINATORS: [&str; 2] = ["OK>", "ERR>"];

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("reader I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("reader closed the session")]
    Closed,
    #[error("no response terminator within {timeout:?} ({received} bytes received)")]
    PollTimeout { timeout: Duration, received: usize },
    #[error("invalid reader address {0:?}")]
    InvalidAddress(String),
}

impl ReaderError {
    /// Reader unreachable or session lost: retried after the retry delay
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ReaderError::Connect { .. }
                | ReaderError::ConnectTimeout { .. }
                | ReaderError::Io(_)
                | ReaderError::Closed
        )
    }
}

/// Source of poll cycles for the tracker's background loop
#[async_trait]
pub trait ReaderLink: Send {
    /// Open a session with the reader
    async fn connect(&mut self) -> Result<(), ReaderError>;

    /// Run one request/response round-trip and return the tags it reported
    async fn poll_once(&mut self) -> Result<Vec<TagId>, ReaderError>;

    /// Simulated links never leave the connected state
    fn is_simulated(&self) -> bool {
        false
    }

    /// Human-readable target, used in log messages
    fn describe(&self) -> String;
}

/// Builds the link a freshly started loop will drive
pub trait LinkFactory: Send + Sync {
    fn create(&self, settings: &MonitorSettings, timings: &MonitorTimings) -> Box<dyn ReaderLink>;
}

impl<F> LinkFactory for F
where
    F: Fn(&MonitorSettings, &MonitorTimings) -> Box<dyn ReaderLink> + Send + Sync,
{
    fn create(&self, settings: &MonitorSettings, timings: &MonitorTimings) -> Box<dyn ReaderLink> {
        self(settings, timings)
    }
}

/// TCP reader in live mode, simulator in simulation mode
#[derive(Debug, Clone)]
pub struct DefaultLinkFactory {
    poll_command: String,
}

impl DefaultLinkFactory {
    pub fn new(poll_command: impl Into<String>) -> Self {
        Self { poll_command: poll_command.into() }
    }
}

impl LinkFactory for DefaultLinkFactory {
    fn create(&self, settings: &MonitorSettings, timings: &MonitorTimings) -> Box<dyn ReaderLink> {
        if settings.simulation_mode {
            Box::new(SimulatedReader::new())
        } else {
            Box::new(TcpReaderLink::new(
                &settings.reader_address,
                settings.reader_port,
                &self.poll_command,
                timings,
            ))
        }
    }
}

pub struct TcpReaderLink {
    host: String,
    port: u16,
    command: Vec<u8>,
    connect_timeout: Duration,
    read_timeout: Duration,
    stream: Option<TcpStream>,
    /// Accumulates one response across chunked reads
    buffer: BytesMut,
    /// Set when a poll timed out before its reply was complete
    reply_owed: bool,
}

impl TcpReaderLink {
    pub fn new(host: &str, port: u16, poll_command: &str, timings: &MonitorTimings) -> Self {
        let mut command = poll_command.as_bytes().to_vec();
        command.extend_from_slice(b"\r\n");
        Self {
            host: host.trim().to_string(),
            port,
            command,
            connect_timeout: timings.connect_timeout,
            read_timeout: timings.read_timeout,
            stream: None,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            reply_owed: false,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Drop the session; the next cycle must reconnect
    fn close(&mut self) {
        self.stream = None;
        self.buffer.clear();
        self.reply_owed = false;
    }

    /// Consume whatever the reader already sent for a timed-out poll.
    /// Returns true when the late reply ended with its terminator.
    fn discard_late_reply(&mut self) -> Result<bool, ReaderError> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(ReaderError::Closed);
        };

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.close();
                    return Err(ReaderError::Closed);
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.close();
                    return Err(ReaderError::Io(e));
                }
            }
        }

        let complete = has_terminator(&self.buffer);
        debug!(bytes = self.buffer.len(), complete, "reader_late_reply_discarded");
        self.buffer.clear();
        Ok(complete)
    }
}

#[async_trait]
impl ReaderLink for TcpReaderLink {
    async fn connect(&mut self) -> Result<(), ReaderError> {
        if self.host.is_empty() || self.host.contains(char::is_whitespace) {
            return Err(ReaderError::InvalidAddress(self.host.clone()));
        }

        self.close();
        let addr = self.addr();
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ReaderError::Connect { addr, source }),
            Err(_) => {
                return Err(ReaderError::ConnectTimeout { addr, timeout: self.connect_timeout })
            }
        };

        stream.set_nodelay(true)?;
        debug!(addr = %addr, "reader_socket_open");
        self.stream = Some(stream);
        Ok(())
    }

    async fn poll_once(&mut self) -> Result<Vec<TagId>, ReaderError> {
        if self.reply_owed {
            if !self.discard_late_reply()? {
                debug!(addr = %self.addr(), "reader_session_resync");
                self.connect().await?;
            }
            self.reply_owed = false;
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(ReaderError::Closed);
        };

        if let Err(e) = stream.write_all(&self.command).await {
            self.close();
            return Err(ReaderError::Io(e));
        }

        self.buffer.clear();
        let deadline = Instant::now() + self.read_timeout;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    self.close();
                    return Err(ReaderError::Closed);
                }
                Ok(Ok(n)) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    if has_terminator(&self.buffer) {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    self.close();
                    return Err(ReaderError::Io(e));
                }
                Err(_) => {
                    self.reply_owed = true;
                    return Err(ReaderError::PollTimeout {
                        timeout: self.read_timeout,
                        received: self.buffer.len(),
                    });
                }
            }
        }

        let text = String::from_utf8_lossy(&self.buffer);
        trace!(bytes = self.buffer.len(), "reader_response_complete");
        Ok(parse_response(&text))
    }

    fn describe(&self) -> String {
        self.addr()
    }
}

/// True once the accumulated response contains a terminator marker
pub fn has_terminator(buf: &[u8]) -> bool {
    TERMINATORS.iter().any(|marker| {
        let marker = marker.as_bytes();
        buf.windows(marker.len()).any(|w| w == marker)
    })
}

/// Split a response into tag identifiers, dropping blanks and terminator lines
pub fn parse_response(text: &str) -> Vec<TagId> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !TERMINATORS.iter().any(|marker| line.starts_with(marker)))
        .map(TagId::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    fn fast_timings() -> MonitorTimings {
        MonitorTimings {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(150),
            ..MonitorTimings::default()
        }
    }

    #[test]
    fn test_parse_response() {
        let tags = parse_response("E2001000AAAA\r\n  E2001000BBBB \r\n\r\nOK>\r\n");
        assert_eq!(tags, vec![TagId::from("E2001000AAAA"), TagId::from("E2001000BBBB")]);
    }

    #[test]
    fn test_parse_response_drops_error_marker() {
        let tags = parse_response("ERR> antenna fault\r\n");
        assert!(tags.is_empty());
    }

    #[test]
    fn test_has_terminator_across_chunks() {
        assert!(!has_terminator(b"E2001000AAAA\r\nO"));
        assert!(has_terminator(b"E2001000AAAA\r\nOK>"));
        assert!(has_terminator(b"ERR>\r\n"));
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(ReaderError::Closed.is_connection_error());
        assert!(!ReaderError::PollTimeout { timeout: Duration::from_secs(2), received: 0 }
            .is_connection_error());
        assert!(!ReaderError::InvalidAddress(String::new()).is_connection_error());
    }

    #[tokio::test]
    async fn test_poll_against_fake_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = tokio::io::BufReader::new(read_half).lines();
            let command = lines.next_line().await.unwrap().unwrap();
            assert_eq!(command, "READ");
            // Response split across two writes
            write_half.write_all(b"E2001000AAAA\r\nE2001").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            write_half.write_all(b"000BBBB\r\nOK>\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut link = TcpReaderLink::new("127.0.0.1", port, "READ", &fast_timings());
        link.connect().await.unwrap();
        let tags = link.poll_once().await.unwrap();
        assert_eq!(tags, vec![TagId::from("E2001000AAAA"), TagId::from("E2001000BBBB")]);
    }

    #[tokio::test]
    async fn test_silent_reader_is_poll_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let mut link = TcpReaderLink::new("127.0.0.1", port, "READ", &fast_timings());
        link.connect().await.unwrap();
        let err = link.poll_once().await.unwrap_err();
        assert!(matches!(err, ReaderError::PollTimeout { received: 0, .. }));
        assert!(!err.is_connection_error());
    }

    /// Reader whose answer to the first `READ` arrives after the read window.
    /// Every later `READ` is answered at once with `NEW<n>`.
    async fn slow_first_reply_reader(
        listener: TcpListener,
        commands: Arc<AtomicUsize>,
        sessions: Arc<AtomicUsize>,
    ) {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            sessions.fetch_add(1, Ordering::SeqCst);
            let commands = commands.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = socket.into_split();
                let mut lines = tokio::io::BufReader::new(read_half).lines();
                while let Ok(Some(_)) = lines.next_line().await {
                    let n = commands.fetch_add(1, Ordering::SeqCst) + 1;
                    let reply = if n == 1 {
                        tokio::time::sleep(Duration::from_millis(250)).await;
                        "OLDTAG\r\nOK>\r\n".to_string()
                    } else {
                        format!("NEW{n}\r\nOK>\r\n")
                    };
                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_late_reply_is_discarded_on_same_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(AtomicUsize::new(0));
        let sessions = Arc::new(AtomicUsize::new(0));
        tokio::spawn(slow_first_reply_reader(listener, commands.clone(), sessions.clone()));

        let mut link = TcpReaderLink::new("127.0.0.1", port, "READ", &fast_timings());
        link.connect().await.unwrap();

        let err = link.poll_once().await.unwrap_err();
        assert!(matches!(err, ReaderError::PollTimeout { .. }));

        // Let the late reply land before the next cycle
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(link.poll_once().await.unwrap(), vec![TagId::from("NEW2")]);
        assert_eq!(link.poll_once().await.unwrap(), vec![TagId::from("NEW3")]);
        assert_eq!(sessions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_late_reply_reopens_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(AtomicUsize::new(0));
        let sessions = Arc::new(AtomicUsize::new(0));
        tokio::spawn(slow_first_reply_reader(listener, commands.clone(), sessions.clone()));

        let mut link = TcpReaderLink::new("127.0.0.1", port, "READ", &fast_timings());
        link.connect().await.unwrap();

        let err = link.poll_once().await.unwrap_err();
        assert!(matches!(err, ReaderError::PollTimeout { .. }));

        // Late reply still in flight: the old session cannot be trusted
        assert_eq!(link.poll_once().await.unwrap(), vec![TagId::from("NEW2")]);
        assert_eq!(link.poll_once().await.unwrap(), vec![TagId::from("NEW3")]);
        assert_eq!(sessions.load(Ordering::SeqCst), 2);

        // The first session's reply never reaches the reopened one
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(link.poll_once().await.unwrap(), vec![TagId::from("NEW4")]);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut link = TcpReaderLink::new("127.0.0.1", port, "READ", &fast_timings());
        let err = link.connect().await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_reader_hangup_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut link = TcpReaderLink::new("127.0.0.1", port, "READ", &fast_timings());
        link.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = link.poll_once().await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_poll_without_session_is_closed() {
        let mut link = TcpReaderLink::new("127.0.0.1", 1, "READ", &fast_timings());
        assert!(matches!(link.poll_once().await, Err(ReaderError::Closed)));
    }

    #[tokio::test]
    async fn test_blank_address_rejected() {
        let mut link = TcpReaderLink::new("  ", 2189, "READ", &fast_timings());
        assert!(matches!(link.connect().await, Err(ReaderError::InvalidAddress(_))));
    }
}
