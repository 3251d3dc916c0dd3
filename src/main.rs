//! httpecho: an echo server for malformed HTTP requests
//!
//! Accepts whatever a client sends, prints it, and echoes every line back
//! so the exact bytes a misbehaving HTTP client produces can be inspected.
//!
//! Features:
//! - Line-by-line echo of raw, unvalidated input
//! - Timeout flush of requests that never send a line terminator
//! - Optional dump of each request to a file
//! - Plain TCP or TLS
//! - Configuration via CLI arguments or TOML file

mod config;
mod conn;
mod observer;
mod server;
mod sink;
mod tls;

use config::Config;
use observer::Console;
use server::Server;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout carries the echoed requests
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!(
        listen = %config.listen_addr(),
        serve = config.serve,
        timeout = ?config.timeout,
        dump = ?config.dump,
        tls = config.tls.is_some(),
        "Starting httpecho"
    );

    let observer = Arc::new(Console::new(config.verbose, config.serve));

    let server = Server::bind(&config, observer).await.map_err(|e| {
        error!(error = %e, "Failed to start server");
        e
    })?;

    server.run().await.map_err(|e| {
        error!(error = %e, "Server stopped");
        e
    })?;

    Ok(())
}
