//! Per-connection echo protocol.
//!
//! Each accepted connection is driven by two tasks:
//!
//! ```text
//!   handler (read loop)                 flusher (timer)
//!   ───────────────────                 ───────────────
//!   read_line ──▶ observer/session       sleep(timeout)
//!        │                                   │
//!        ▼                                   ▼
//!   echo line ──▶ peer                  peek pending ──▶ peer
//!        │                                   │
//!        └────────────▶ Connection::close ◀──┘
//! ```
//!
//! The two tasks share only the connection's write half, its close flag and
//! the reader's pending bytes. Whichever side calls [`Connection::close`]
//! first wins; the other side sees [`ConnError::Closed`] and backs off.

pub mod flusher;
pub mod handler;
pub mod reader;

pub use handler::Handler;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::trace;

/// Longest wait for a graceful shutdown (TLS close_notify) once closed
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors surfaced by connection reads and writes.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// The connection was closed locally, by the read loop or the flusher.
    #[error("connection already closed")]
    Closed,
    /// The connection deadline passed.
    #[error("connection timed out")]
    TimedOut,
    #[error(transparent)]
    Io(io::Error),
}

impl ConnError {
    /// Errors that are the normal outcome of the read loop racing the flusher.
    pub fn is_expected_closure(&self) -> bool {
        matches!(self, ConnError::Closed | ConnError::TimedOut)
    }
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => ConnError::TimedOut,
            _ => ConnError::Io(e),
        }
    }
}

/// Write side and close state of one connection.
///
/// Shared between the read loop and the flusher. The read half is handed
/// out separately by [`Connection::new`] and owned by the line reader.
/// A pending write never outlives [`Connection::close`], so a peer that
/// stops reading cannot keep the connection open.
pub struct Connection<S> {
    peer: SocketAddr,
    writer: Mutex<Option<WriteHalf<S>>>,
    closed: watch::Sender<bool>,
    deadline: Option<Instant>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Split `stream` into a shared connection handle and its read half.
    pub fn new(stream: S, peer: SocketAddr) -> (Arc<Self>, ReadHalf<S>) {
        Self::with_deadline(stream, peer, None)
    }

    /// Like [`new`](Self::new), but writes fail with [`ConnError::TimedOut`]
    /// once `deadline` passes.
    pub fn with_deadline(
        stream: S,
        peer: SocketAddr,
        deadline: Option<Instant>,
    ) -> (Arc<Self>, ReadHalf<S>) {
        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        let conn = Connection {
            peer,
            writer: Mutex::new(Some(writer)),
            closed,
            deadline,
        };
        (Arc::new(conn), reader)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write all of `bytes` to the peer.
    ///
    /// Fails with [`ConnError::Closed`] once the connection has been closed,
    /// including while the write is still waiting on the peer. Whatever part
    /// of `bytes` was not yet accepted by then is dropped.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), ConnError> {
        let mut closed = self.subscribe();

        tokio::select! {
            biased;

            _ = wait_closed(&mut closed) => Err(ConnError::Closed),

            _ = deadline_elapsed(self.deadline) => Err(ConnError::TimedOut),

            res = async {
                let mut guard = self.writer.lock().await;
                let writer = guard.as_mut().ok_or(ConnError::Closed)?;
                writer.write_all(bytes).await?;
                writer.flush().await?;
                Ok::<_, ConnError>(())
            } => res,
        }
    }

    /// Close the connection.
    ///
    /// Returns `true` for the call that actually closed it; every later call
    /// is a no-op returning `false`.
    pub async fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }

        // In-flight writes see the flag and release the writer
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => trace!(peer = %self.peer, error = %e, "Shutdown after close"),
                Err(_) => trace!(peer = %self.peer, "Shutdown timed out"),
            }
        }
        trace!(peer = %self.peer, "Connection closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Subscribe to the close flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        wait_closed(&mut self.subscribe()).await;
    }
}

/// Wait until the close flag is raised.
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender means the connection is gone as well.
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Resolves at `deadline`, or never without one.
pub(crate) async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
