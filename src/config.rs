//! Configuration module for httpecho.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "httpecho")]
#[command(version = "0.1.0")]
#[command(about = "Echo server accepting malformed HTTP requests", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serve continuously (default: wait for 1 request)
    #[arg(short, long)]
    pub serve: bool,

    /// Timeout in milliseconds before an unterminated request is flushed and the connection closed
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Dump incoming request to a file (default: only print to stdout)
    #[arg(short, long)]
    pub dump: Option<PathBuf>,

    /// Listening port
    #[arg(short, long)]
    pub port: Option<String>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Use TLS encryption for communication
    #[arg(long)]
    pub tls: bool,

    /// Certificate chain in PEM format (default: ~/.httpecho/server.crt)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Private key in PEM format (default: ~/.httpecho/server.key)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Show line terminators (\r, \n) in the console output
    #[arg(short, long)]
    pub verbose: bool,

    /// Send an HTTP status line to the client before reading
    #[arg(short, long)]
    pub ack: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default)]
    pub serve: bool,
    /// Flush timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub ack: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            serve: false,
            timeout_ms: default_timeout_ms(),
            ack: false,
        }
    }
}

/// Request dump configuration
#[derive(Debug, Deserialize, Default)]
pub struct DumpConfig {
    pub path: Option<PathBuf>,
}

/// TLS configuration
#[derive(Debug, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Console output configuration
#[derive(Debug, Deserialize, Default)]
pub struct OutputConfig {
    #[serde(default)]
    pub verbose: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> String {
    "8888".to_string()
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where TLS credentials come from when `--tls` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsPaths {
    /// Overrides `~/.httpecho/server.crt`
    pub cert_file: Option<PathBuf>,
    /// Overrides `~/.httpecho/server.key`
    pub key_file: Option<PathBuf>,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: String,
    /// Serve continuously instead of handling a single connection
    pub serve: bool,
    /// Delay before the pending bytes of a connection are flushed and it is closed
    pub timeout: Duration,
    /// Dump file; `None` means console only
    pub dump: Option<PathBuf>,
    /// TLS credentials; `None` means plain TCP
    pub tls: Option<TlsPaths>,
    pub verbose: bool,
    /// Write [`ACK_LINE`](crate::conn::handler::ACK_LINE) before reading
    pub ack: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let port = cli.port.unwrap_or(toml_config.server.port);
        if port.parse::<u16>().is_err() {
            return Err(ConfigError::InvalidPort(port));
        }

        let tls = if cli.tls || toml_config.tls.enabled {
            Some(TlsPaths {
                cert_file: cli.tls_cert.or(toml_config.tls.cert_file),
                key_file: cli.tls_key.or(toml_config.tls.key_file),
            })
        } else {
            None
        };

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            serve: cli.serve || toml_config.server.serve,
            timeout: Duration::from_millis(cli.timeout.unwrap_or(toml_config.server.timeout_ms)),
            dump: cli
                .dump
                .or(toml_config.dump.path)
                .filter(|p| !p.as_os_str().is_empty()),
            tls,
            verbose: cli.verbose || toml_config.output.verbose,
            ack: cli.ack || toml_config.server.ack,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid port '{0}'")]
    InvalidPort(String),
}
