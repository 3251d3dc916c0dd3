//! Line-buffered reader with a peekable pending buffer.
//!
//! [`LineReader::read_line`] returns everything up to and including the next
//! `\n`. Bytes that arrived but are not yet part of a complete line stay in
//! the shared [`PendingBytes`] buffer, where the flusher can see them
//! without touching the network.

use super::{deadline_elapsed, wait_closed, ConnError};
use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::Instant;

/// Read buffer size
const READ_CHUNK: usize = 4 * 1024;

/// Bytes received but not yet returned as a line.
///
/// Cloning yields another handle to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct PendingBytes(Arc<Mutex<BytesMut>>);

impl PendingBytes {
    /// Copy of the buffered bytes. Does not consume them.
    pub fn peek(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock())
    }

    /// Number of bytes [`peek`](Self::peek) would return.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub(super) fn extend(&self, data: &[u8]) {
        self.lock().extend_from_slice(data);
    }

    /// Remove and return the first complete line, terminator included.
    fn take_line(&self) -> Option<Bytes> {
        let mut buf = self.lock();
        let end = buf.iter().position(|&b| b == b'\n')?;
        Some(buf.split_to(end + 1).freeze())
    }

    fn take_all(&self) -> Bytes {
        self.lock().split().freeze()
    }

    fn lock(&self) -> MutexGuard<'_, BytesMut> {
        // Buffer contents stay valid even if a holder panicked
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Why a line came back without a terminator.
#[derive(Debug)]
pub enum StreamEnd {
    /// The peer finished sending.
    Eof,
    /// The read failed or the connection was closed underneath it.
    Failed(ConnError),
}

/// One result of [`LineReader::read_line`].
#[derive(Debug)]
pub struct Line {
    pub bytes: Bytes,
    /// `None` when the line ends with `\n`.
    pub end: Option<StreamEnd>,
}

impl Line {
    pub fn is_terminated(&self) -> bool {
        self.end.is_none()
    }
}

/// Reads `\n`-terminated lines from an async byte stream.
pub struct LineReader<R> {
    inner: R,
    pending: PendingBytes,
    scratch: BytesMut,
    closed: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Create a reader that stops as soon as `closed` turns `true`.
    pub fn new(inner: R, closed: watch::Receiver<bool>) -> Self {
        Self {
            inner,
            pending: PendingBytes::default(),
            scratch: BytesMut::with_capacity(READ_CHUNK),
            closed,
            deadline: None,
        }
    }

    /// Fail reads with [`ConnError::TimedOut`] once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Handle to the bytes buffered but not yet returned.
    pub fn pending(&self) -> PendingBytes {
        self.pending.clone()
    }

    /// Read up to and including the next `\n`.
    ///
    /// If the stream ends, fails or is closed first, returns whatever partial
    /// bytes were buffered along with the reason.
    pub async fn read_line(&mut self) -> Line {
        loop {
            if let Some(bytes) = self.pending.take_line() {
                return Line { bytes, end: None };
            }

            if let Err(end) = self.fill().await {
                return Line {
                    bytes: self.pending.take_all(),
                    end: Some(end),
                };
            }
        }
    }

    /// Move the next chunk from the stream into the pending buffer.
    async fn fill(&mut self) -> Result<(), StreamEnd> {
        let Self {
            inner,
            pending,
            scratch,
            closed,
            deadline,
        } = self;

        tokio::select! {
            biased;

            _ = wait_closed(closed) => Err(StreamEnd::Failed(ConnError::Closed)),

            _ = deadline_elapsed(*deadline) => Err(StreamEnd::Failed(ConnError::TimedOut)),

            res = inner.read_buf(scratch) => match res {
                Ok(0) => Err(StreamEnd::Eof),
                Ok(_) => {
                    pending.extend(scratch);
                    scratch.clear();
                    Ok(())
                }
                Err(e) => Err(StreamEnd::Failed(e.into())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    fn never_closed() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_lines_across_chunks() {
        let (_tx, rx) = never_closed();
        let mock = Builder::new()
            .read(b"GET / HT")
            .read(b"TP/1.1\r\n\r\n")
            .build();
        let mut reader = LineReader::new(mock, rx);

        let line = reader.read_line().await;
        assert!(line.is_terminated());
        assert_eq!(&line.bytes[..], b"GET / HTTP/1.1\r\n");

        let line = reader.read_line().await;
        assert!(line.is_terminated());
        assert_eq!(&line.bytes[..], b"\r\n");

        let line = reader.read_line().await;
        assert!(matches!(line.end, Some(StreamEnd::Eof)));
        assert!(line.bytes.is_empty());
    }

    #[tokio::test]
    async fn test_unterminated_tail_at_eof() {
        let (_tx, rx) = never_closed();
        let mock = Builder::new().read(b"one\ntwo").build();
        let mut reader = LineReader::new(mock, rx);

        let line = reader.read_line().await;
        assert_eq!(&line.bytes[..], b"one\n");

        let line = reader.read_line().await;
        assert!(!line.is_terminated());
        assert!(matches!(line.end, Some(StreamEnd::Eof)));
        assert_eq!(&line.bytes[..], b"two");
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (_tx, rx) = never_closed();
        let mock = Builder::new().read(b"one\ntwo").build();
        let mut reader = LineReader::new(mock, rx);
        let pending = reader.pending();

        assert_eq!(pending.len(), 0);
        reader.read_line().await;

        assert_eq!(pending.len(), 3);
        assert_eq!(&pending.peek()[..], b"two");
        assert_eq!(&pending.peek()[..], b"two");
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn test_read_error_returns_partial() {
        let (_tx, rx) = never_closed();
        let mock = Builder::new()
            .read(b"partial")
            .read_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .build();
        let mut reader = LineReader::new(mock, rx);

        let line = reader.read_line().await;
        assert_eq!(&line.bytes[..], b"partial");
        match line.end {
            Some(StreamEnd::Failed(e)) => assert!(!e.is_expected_closure()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_interrupts_read() {
        let (tx, rx) = watch::channel(false);
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = LineReader::new(server, rx);
        let pending = reader.pending();

        client.write_all(b"GET / HTTP/1.1").await.unwrap();
        let task = tokio::spawn(async move { reader.read_line().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while pending.len() < 14 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        tx.send_replace(true);
        let line = task.await.unwrap();
        assert_eq!(&line.bytes[..], b"GET / HTTP/1.1");
        assert!(matches!(line.end, Some(StreamEnd::Failed(ConnError::Closed))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let (_tx, rx) = never_closed();
        let (_client, server) = tokio::io::duplex(64);
        let start = Instant::now();
        let mut reader = LineReader::new(server, rx).with_deadline(start + Duration::from_secs(1));

        let line = reader.read_line().await;
        assert!(matches!(line.end, Some(StreamEnd::Failed(ConnError::TimedOut))));
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
