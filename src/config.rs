//! Configuration for the transport and the `framewire` binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::frame::DEFAULT_MAX_FRAME;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments for the transport tools
#[derive(Parser, Debug)]
#[command(name = "framewire")]
#[command(author = "framewire authors")]
#[command(version = "0.1.0")]
#[command(about = "Length-prefixed TCP transport with pooled buffers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long, global = true)]
    pub workers: Option<usize>,

    /// Number of pooled chunks
    #[arg(long, global = true)]
    pub chunk_count: Option<usize>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Run an echo server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind to
        #[arg(short, long)]
        bind: Option<IpAddr>,
    },
    /// Connect, send payloads and verify the echoes
    Ping {
        /// Host to connect to
        #[arg(long)]
        host: Option<String>,

        /// Port to connect to
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of payloads to send
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Size of each payload in bytes
        #[arg(short, long, default_value_t = 4)]
        size: usize,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Host to connect to
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

/// Which resolved address the client connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSelection {
    /// First address returned by name resolution.
    First,
    /// Last address returned by name resolution.
    #[default]
    Last,
}

impl AddressSelection {
    pub fn pick(self, addrs: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddr> {
        let mut addrs = addrs.into_iter();
        match self {
            AddressSelection::First => addrs.next(),
            AddressSelection::Last => addrs.last(),
        }
    }
}

/// Settings shared by the server and the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Size of each pooled chunk in bytes
    pub chunk_size: usize,
    /// Number of chunks pre-allocated per server or client
    pub chunk_count: usize,
    /// Largest accepted payload
    pub max_frame_size: usize,
    /// Listen backlog
    pub backlog: i32,
    /// Disable Nagle's algorithm on connections
    pub nodelay: bool,
    /// Worker threads of the completion runtime (0 = available parallelism)
    pub worker_threads: usize,
    /// Connections the server keeps at most
    pub max_connections: usize,
    /// Address the server binds to
    pub bind_address: IpAddr,
    /// Resolved address the client connects to
    pub address_selection: AddressSelection,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            chunk_count: 4096,
            max_frame_size: DEFAULT_MAX_FRAME,
            backlog: 100,
            nodelay: true,
            worker_threads: 0,
            max_connections: 10_000,
            bind_address: default_bind(),
            address_selection: AddressSelection::default(),
        }
    }
}

impl TransportConfig {
    /// Reject settings the transport cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.chunk_size == 0 {
            return invalid("chunk_size", "must be positive");
        }
        if self.chunk_count == 0 {
            return invalid("chunk_count", "must be positive");
        }
        if self.chunk_size.checked_mul(self.chunk_count).is_none() {
            return invalid("chunk_count", "pool size overflows");
        }
        if self.max_frame_size == 0 || self.max_frame_size > i32::MAX as usize {
            return invalid("max_frame_size", "must be between 1 and 2147483647");
        }
        if self.backlog <= 0 {
            return invalid("backlog", "must be positive");
        }
        if self.max_connections == 0 {
            return invalid("max_connections", "must be positive");
        }
        Ok(())
    }

    /// Worker threads to start, resolving 0 to the available parallelism.
    pub fn workers(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.worker_threads
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    7777
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the binary was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Ping { count: usize, size: usize },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub transport: TransportConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut transport = toml_config.transport;
        transport.bind_address = toml_config.server.bind;
        if let Some(workers) = cli.workers {
            transport.worker_threads = workers;
        }
        if let Some(chunk_count) = cli.chunk_count {
            transport.chunk_count = chunk_count;
        }

        let (mode, host, port) = match cli.command {
            CliCommand::Serve { port, bind } => {
                if let Some(bind) = bind {
                    transport.bind_address = bind;
                }
                (
                    Mode::Serve,
                    toml_config.client.host,
                    port.unwrap_or(toml_config.server.port),
                )
            }
            CliCommand::Ping {
                host,
                port,
                count,
                size,
            } => (
                Mode::Ping { count, size },
                host.unwrap_or(toml_config.client.host),
                port.unwrap_or(toml_config.server.port),
            ),
        };

        transport.validate()?;

        Ok(Config {
            mode,
            host,
            port,
            transport,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}
