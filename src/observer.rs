//! Console rendering of received requests.
//!
//! Lines are written to stdout exactly as received, so the operator sees the
//! raw request. Diagnostics go through `tracing` on stderr instead.

use std::borrow::Cow;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

/// Receives everything a connection handler reports about a session.
pub trait Observer: Send + Sync {
    /// A connection was accepted.
    fn connection(&self, _peer: SocketAddr) {}

    /// A line (terminated or not) arrived from `peer`.
    fn line(&self, peer: SocketAddr, bytes: &[u8]);

    /// The session was dumped to `path`.
    fn dumped(&self, path: &Path);
}

/// Stdout observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Console {
    verbose: bool,
    separators: bool,
}

impl Console {
    /// `verbose` makes `\r` and `\n` visible; `separators` prints a
    /// timestamped header before each connection.
    pub fn new(verbose: bool, separators: bool) -> Self {
        Self {
            verbose,
            separators,
        }
    }
}

impl Observer for Console {
    fn connection(&self, peer: SocketAddr) {
        if self.separators {
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "----- {now} {peer} -----");
        }
    }

    fn line(&self, _peer: SocketAddr, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(&render(bytes, self.verbose));
        let _ = out.flush();
    }

    fn dumped(&self, path: &Path) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "dump request in: {}", path.display());
    }
}

/// Render a line for display.
///
/// Verbose mode spells out `\r` and `\n` while keeping the line break.
pub fn render(bytes: &[u8], verbose: bool) -> Cow<'_, [u8]> {
    if !verbose || !bytes.iter().any(|&b| b == b'\r' || b == b'\n') {
        return Cow::Borrowed(bytes);
    }

    let mut out = Vec::with_capacity(bytes.len() + 8);
    for &b in bytes {
        match b {
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\n' => out.extend_from_slice(b"\\n\n"),
            _ => out.push(b),
        }
    }
    Cow::Owned(out)
}

/// Observer that keeps everything in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct Recorder {
    pub connections: std::sync::Mutex<Vec<SocketAddr>>,
    pub lines: std::sync::Mutex<Vec<Vec<u8>>>,
    pub dumps: std::sync::Mutex<Vec<std::path::PathBuf>>,
}

#[cfg(test)]
impl Recorder {
    /// All received bytes, concatenated in arrival order.
    pub fn received(&self) -> Vec<u8> {
        self.lines.lock().unwrap().concat()
    }
}

#[cfg(test)]
impl Observer for Recorder {
    fn connection(&self, peer: SocketAddr) {
        self.connections.lock().unwrap().push(peer);
    }

    fn line(&self, _peer: SocketAddr, bytes: &[u8]) {
        self.lines.lock().unwrap().push(bytes.to_vec());
    }

    fn dumped(&self, path: &Path) {
        self.dumps.lock().unwrap().push(path.to_path_buf());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_render_is_verbatim() {
        let line = b"GET / HTTP/1.1\r\n";
        assert!(matches!(render(line, false), Cow::Borrowed(_)));
        assert_eq!(&render(line, false)[..], line);
    }

    #[test]
    fn test_verbose_render() {
        assert_eq!(&render(b"GET / HTTP/1.1\r\n", true)[..], b"GET / HTTP/1.1\\r\\n\n");
        assert_eq!(&render(b"\n", true)[..], b"\\n\n");
        assert_eq!(&render(b"no terminator", true)[..], b"no terminator");
    }
}
