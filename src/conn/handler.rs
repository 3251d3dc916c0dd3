//! Connection handler.
//!
//! Drives one connection through `Greeting → Reading → Done`:
//! optionally acknowledge, then read lines, show and record each one, echo
//! the terminated ones, and dump the session once reading ends.

use super::reader::{Line, LineReader, StreamEnd};
use super::flusher::{self, FlushOutcome};
use super::{ConnError, Connection};
use crate::config::Config;
use crate::observer::Observer;
use crate::sink::{Sink, SinkError};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Status line sent before reading when acknowledgment is enabled.
pub const ACK_LINE: &[u8] = b"HTTP/1.1 200 OK\r\n";

/// Handles connections with one server's settings.
pub struct Handler {
    timeout: Duration,
    ack: bool,
    sink: Sink,
    observer: Arc<dyn Observer>,
}

impl Handler {
    pub fn new(config: &Config, observer: Arc<dyn Observer>) -> Self {
        Self {
            timeout: config.timeout,
            ack: config.ack,
            sink: Sink::new(config.dump.as_deref()),
            observer,
        }
    }

    /// Handle one connection until it is closed.
    ///
    /// Reads and writes fail with [`ConnError::TimedOut`] after `deadline`,
    /// if given.
    /// Only dump file failures are returned; connection errors are logged
    /// here and end the connection.
    pub async fn handle<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        deadline: Option<Instant>,
    ) -> Result<(), SinkError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.sink.prepare().await?;
        self.observer.connection(peer);

        let (conn, read_half) = Connection::with_deadline(stream, peer, deadline);
        let mut reader = LineReader::new(read_half, conn.subscribe());
        if let Some(deadline) = deadline {
            reader = reader.with_deadline(deadline);
        }
        let flusher = flusher::spawn(Arc::clone(&conn), reader.pending(), self.timeout);

        if self.ack {
            if let Err(e) = conn.write(ACK_LINE).await {
                report(peer, "acknowledge", &e);
            }
        }

        let mut session = self.sink.path().map(|_| BytesMut::new());
        let mut lines = 0usize;

        loop {
            let line = reader.read_line().await;
            trace!(peer = %peer, len = line.bytes.len(), terminated = line.is_terminated(), "Line received");
            let Line { bytes, end } = line;

            self.observer.line(peer, &bytes);
            if let Some(session) = session.as_mut() {
                session.extend_from_slice(&bytes);
            }

            if let Some(end) = end {
                match end {
                    StreamEnd::Eof => debug!(peer = %peer, lines, "Connection closed by peer"),
                    StreamEnd::Failed(e) => report(peer, "read", &e),
                }
                break;
            }
            lines += 1;

            if let Err(e) = conn.write(&bytes).await {
                report(peer, "echo", &e);
                // The next read drains what is still buffered and ends the loop
                conn.close().await;
            }
        }

        let persisted = match session {
            Some(session) => self.sink.persist(&session).await,
            None => Ok(None),
        };

        conn.close().await;
        match flusher.await {
            Ok(FlushOutcome::Flushed(bytes)) => trace!(peer = %peer, bytes, "Flusher closed the connection"),
            Ok(FlushOutcome::Cancelled) => trace!(peer = %peer, "Flusher cancelled"),
            Err(e) => warn!(peer = %peer, error = %e, "Flusher task failed"),
        }

        if let Some(path) = persisted? {
            self.observer.dumped(path);
        }
        Ok(())
    }
}

/// Log a connection error unless it is the expected end of the flusher race.
fn report(peer: SocketAddr, op: &str, e: &ConnError) {
    if e.is_expected_closure() {
        trace!(peer = %peer, op, error = %e, "Connection ended");
    } else {
        warn!(peer = %peer, op, error = %e, "Connection error");
    }
}
