//! Request dump sink.
//!
//! A connection's lines are collected in memory and written here once, when
//! the connection ends. Without a dump path the console is the only output.

use std::path::{Path, PathBuf};

/// Where a finished request is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    /// Console only; nothing is persisted.
    Console,
    /// Truncate-or-create this file with the whole request.
    File(PathBuf),
}

/// Dump file errors. Both are fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to create dump file '{}': {source}", .path.display())]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write dump file '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Sink {
    pub fn new(dump: Option<&Path>) -> Self {
        match dump {
            Some(path) => Sink::File(path.to_path_buf()),
            None => Sink::Console,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Sink::Console => None,
            Sink::File(path) => Some(path.as_path()),
        }
    }

    /// Create (or truncate) the dump file when a connection starts.
    pub async fn prepare(&self) -> Result<(), SinkError> {
        if let Sink::File(path) = self {
            tokio::fs::File::create(path)
                .await
                .map_err(|source| SinkError::Create {
                    path: path.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Write the whole request in a single write, replacing any previous content.
    ///
    /// Returns the path written, if any.
    pub async fn persist(&self, request: &[u8]) -> Result<Option<&Path>, SinkError> {
        match self {
            Sink::Console => Ok(None),
            Sink::File(path) => {
                tokio::fs::write(path, request)
                    .await
                    .map_err(|source| SinkError::Write {
                        path: path.clone(),
                        source,
                    })?;
                Ok(Some(path.as_path()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("httpecho-sink-{}-{}", std::process::id(), name))
    }

    #[tokio::test]
    async fn test_console_persists_nothing() {
        let sink = Sink::new(None);
        sink.prepare().await.unwrap();
        assert_eq!(sink.persist(b"GET / HTTP/1.1\r\n").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persist_overwrites() {
        let path = temp_path("overwrite");
        std::fs::write(&path, b"a much longer previous request\r\n").unwrap();

        let sink = Sink::new(Some(&path));
        sink.prepare().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"");

        let written = sink.persist(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(written, Some(path.as_path()));
        assert_eq!(std::fs::read(&path).unwrap(), b"GET / HTTP/1.1\r\n\r\n");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_unusable_path() {
        let path = temp_path("missing-dir").join("out.txt");
        let sink = Sink::new(Some(&path));

        assert!(matches!(sink.prepare().await, Err(SinkError::Create { .. })));
        assert!(matches!(sink.persist(b"x").await, Err(SinkError::Write { .. })));
    }
}
