//! Timeout flusher.
//!
//! A peer that never sends `\n` would leave the read loop waiting forever.
//! The flusher is armed once when the connection starts; when it fires it
//! writes the pending bytes back to the peer and closes the connection,
//! which also ends the read loop. The write back is itself bounded by the
//! timeout, so a peer that stops reading still gets closed.

use super::reader::PendingBytes;
use super::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// How the flusher finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The timer fired; this many pending bytes were sent back.
    Flushed(usize),
    /// The connection closed before the timer fired.
    Cancelled,
}

/// Spawn the flusher for one connection.
pub fn spawn<S>(
    conn: Arc<Connection<S>>,
    pending: PendingBytes,
    timeout: Duration,
) -> JoinHandle<FlushOutcome>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(run(conn, pending, timeout))
}

async fn run<S>(conn: Arc<Connection<S>>, pending: PendingBytes, timeout: Duration) -> FlushOutcome
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::select! {
        _ = conn.closed() => {
            return FlushOutcome::Cancelled;
        }
        _ = tokio::time::sleep(timeout) => {}
    }

    trace!(peer = %conn.peer(), buffered = pending.len(), "Flush timer fired");
    let residue = pending.peek();
    if !residue.is_empty() {
        match tokio::time::timeout(timeout, conn.write(&residue)).await {
            Ok(Ok(())) => {
                debug!(peer = %conn.peer(), bytes = residue.len(), "Flushed unterminated request");
            }
            Ok(Err(e)) if e.is_expected_closure() => {
                trace!(peer = %conn.peer(), "Connection closed before flush");
            }
            Ok(Err(e)) => {
                warn!(peer = %conn.peer(), bytes = residue.len(), error = %e, "Failed to flush pending bytes");
            }
            Err(_) => {
                warn!(peer = %conn.peer(), bytes = residue.len(), "Peer not reading, dropping pending bytes");
            }
        }
    }

    conn.close().await;
    FlushOutcome::Flushed(residue.len())
}
