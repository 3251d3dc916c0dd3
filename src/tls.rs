//! TLS configuration and certificate loading.

use crate::config::TlsPaths;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Directory under `$HOME` holding the default credentials.
pub const CREDENTIALS_DIR: &str = ".httpecho";

/// Errors while loading TLS credentials.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("HOME is not set; cannot locate ~/.httpecho")]
    NoHome,
    #[error("failed to read '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no certificates found in '{}'", .0.display())]
    NoCertificates(PathBuf),
    #[error("no private key found in '{}'", .0.display())]
    NoPrivateKey(PathBuf),
    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// A certificate chain and its private key.
pub struct Credentials {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Source of server credentials.
pub trait CredentialProvider {
    fn load(&self) -> Result<Credentials, TlsError>;
}

/// PEM certificate and key files on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemFiles {
    cert: PathBuf,
    key: PathBuf,
}

impl PemFiles {
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// `~/.httpecho/server.crt` and `~/.httpecho/server.key`.
    pub fn in_home_dir() -> Result<Self, TlsError> {
        let dir = home_credentials_dir()?;
        Ok(Self::new(dir.join("server.crt"), dir.join("server.key")))
    }

    /// Configured paths, falling back to the home directory files.
    pub fn from_paths(paths: &TlsPaths) -> Result<Self, TlsError> {
        if let (Some(cert), Some(key)) = (&paths.cert_file, &paths.key_file) {
            return Ok(Self::new(cert, key));
        }

        let home = Self::in_home_dir()?;
        Ok(Self::new(
            paths.cert_file.clone().unwrap_or(home.cert),
            paths.key_file.clone().unwrap_or(home.key),
        ))
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert
    }

    pub fn key_path(&self) -> &Path {
        &self.key
    }
}

impl CredentialProvider for PemFiles {
    fn load(&self) -> Result<Credentials, TlsError> {
        let certs = rustls_pemfile::certs(&mut open(&self.cert)?)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsError::Read {
                path: self.cert.clone(),
                source,
            })?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates(self.cert.clone()));
        }

        let key = rustls_pemfile::private_key(&mut open(&self.key)?)
            .map_err(|source| TlsError::Read {
                path: self.key.clone(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey(self.key.clone()))?;

        Ok(Credentials { certs, key })
    }
}

/// Build a TLS acceptor from the provider's credentials.
pub fn acceptor(provider: &dyn CredentialProvider) -> Result<TlsAcceptor, TlsError> {
    let Credentials { certs, key } = provider.load()?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn home_credentials_dir() -> Result<PathBuf, TlsError> {
    let home = std::env::var_os("HOME").ok_or(TlsError::NoHome)?;
    Ok(PathBuf::from(home).join(CREDENTIALS_DIR))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::PrivatePkcs8KeyDer;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("httpecho-tls-{}-{}", std::process::id(), name))
    }

    struct Fixed;

    impl CredentialProvider for Fixed {
        fn load(&self) -> Result<Credentials, TlsError> {
            Ok(Credentials {
                certs: vec![CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x01])],
                key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(vec![0u8; 16])),
            })
        }
    }

    #[test]
    fn test_explicit_paths_win() {
        let paths = TlsPaths {
            cert_file: Some(PathBuf::from("/etc/httpecho/cert.pem")),
            key_file: Some(PathBuf::from("/etc/httpecho/key.pem")),
        };
        let files = PemFiles::from_paths(&paths).unwrap();
        assert_eq!(files.cert_path(), Path::new("/etc/httpecho/cert.pem"));
        assert_eq!(files.key_path(), Path::new("/etc/httpecho/key.pem"));
    }

    #[test]
    fn test_home_dir_layout() {
        if std::env::var_os("HOME").is_none() {
            return;
        }
        let files = PemFiles::in_home_dir().unwrap();
        assert!(files.cert_path().ends_with(".httpecho/server.crt"));
        assert!(files.key_path().ends_with(".httpecho/server.key"));
    }

    #[test]
    fn test_missing_certificate_file() {
        let files = PemFiles::new(temp_path("missing.crt"), temp_path("missing.key"));
        assert!(matches!(files.load(), Err(TlsError::Read { .. })));
    }

    #[test]
    fn test_no_pem_blocks() {
        let cert = temp_path("empty.crt");
        let key = temp_path("empty.key");
        std::fs::write(&cert, "not a certificate\n").unwrap();
        std::fs::write(&key, "not a key\n").unwrap();

        let files = PemFiles::new(&cert, &key);
        assert!(matches!(files.load(), Err(TlsError::NoCertificates(_))));

        std::fs::remove_file(&cert).unwrap();
        std::fs::remove_file(&key).unwrap();
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(matches!(acceptor(&Fixed), Err(TlsError::Rustls(_))));
    }
}
