//! TCP server accepting echo connections.
//!
//! Binds the listener (plain or TLS), then hands each accepted connection to
//! a [`Handler`], either once or for as long as the process runs.

use crate::config::Config;
use crate::conn::Handler;
use crate::observer::Observer;
use crate::sink::SinkError;
use crate::tls::{self, PemFiles, TlsError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent connections in serve mode
const MAX_CONNECTIONS: usize = 10000;

/// Extra time past the flush timeout before reads on a served connection fail
const DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// Server errors. All of them end the process.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to load TLS credentials: {0}")]
    Tls(#[from] TlsError),
    #[error("failed to accept connection: {0}")]
    Accept(io::Error),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// How accepted sockets are wrapped.
#[derive(Clone)]
pub enum Transport {
    Plain,
    Tls(TlsAcceptor),
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    transport: Transport,
    handler: Arc<Handler>,
    serve: bool,
    timeout: Duration,
}

impl Server {
    /// Load credentials if needed and bind the listener.
    pub async fn bind(config: &Config, observer: Arc<dyn Observer>) -> Result<Self, ServerError> {
        let transport = match &config.tls {
            Some(paths) => {
                let files = PemFiles::from_paths(paths)?;
                debug!(
                    cert = %files.cert_path().display(),
                    key = %files.key_path().display(),
                    "Loading TLS credentials"
                );
                Transport::Tls(tls::acceptor(&files)?)
            }
            None => Transport::Plain,
        };

        let addr = config.listen_addr();
        let bind_error = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = bind_listener(&addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!(
            address = %local_addr,
            tls = matches!(transport, Transport::Tls(_)),
            serve = config.serve,
            "Server listening"
        );

        Ok(Server {
            listener,
            transport,
            handler: Arc::new(Handler::new(config, observer)),
            serve: config.serve,
            timeout: config.timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve one connection, or all of them in serve mode.
    pub async fn run(self) -> Result<(), ServerError> {
        if self.serve {
            self.serve_forever().await
        } else {
            self.serve_once().await
        }
    }

    /// Accept a single connection and handle it on this task. The listener
    /// is dropped before handling starts, so later connections are refused.
    async fn serve_once(self) -> Result<(), ServerError> {
        let (stream, peer) = self.listener.accept().await.map_err(ServerError::Accept)?;
        drop(self.listener);
        debug!(peer = %peer, "New connection");

        let handshake_deadline = Instant::now() + self.timeout + DEADLINE_GRACE;
        dispatch(&self.handler, &self.transport, stream, peer, handshake_deadline, None).await?;
        Ok(())
    }

    async fn serve_forever(self) -> Result<(), ServerError> {
        let connection_limit = Arc::new(Semaphore::new(MAX_CONNECTIONS));
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<SinkError>(1);

        loop {
            tokio::select! {
                Some(e) = fatal_rx.recv() => return Err(e.into()),

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New connection");

                        let permit = match connection_limit.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!(peer = %peer, "Connection limit reached, dropping connection");
                                continue;
                            }
                        };

                        let deadline = Instant::now() + self.timeout + DEADLINE_GRACE;
                        let handler = Arc::clone(&self.handler);
                        let transport = self.transport.clone();
                        let fatal_tx = fatal_tx.clone();

                        tokio::spawn(async move {
                            let result =
                                dispatch(&handler, &transport, stream, peer, deadline, Some(deadline)).await;
                            if let Err(e) = result {
                                let _ = fatal_tx.send(e).await;
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }
    }
}

/// Run the TLS handshake if needed, then the handler.
async fn dispatch(
    handler: &Handler,
    transport: &Transport,
    stream: TcpStream,
    peer: SocketAddr,
    handshake_deadline: Instant,
    read_deadline: Option<Instant>,
) -> Result<(), SinkError> {
    match transport {
        Transport::Plain => handler.handle(stream, peer, read_deadline).await,
        Transport::Tls(acceptor) => {
            match tokio::time::timeout_at(handshake_deadline, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => handler.handle(stream, peer, read_deadline).await,
                Ok(Err(e)) => {
                    warn!(peer = %peer, error = %e, "TLS handshake failed");
                    Ok(())
                }
                Err(_) => {
                    warn!(peer = %peer, "TLS handshake timed out");
                    Ok(())
                }
            }
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR.
async fn bind_listener(addr: &str) -> io::Result<TcpListener> {
    let addr = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {addr}"))
    })?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}
