//! Errors surfaced by the transport API.
//!
//! Per-connection failures never show up here: they close the connection and
//! reach the application as a `Disconnected` event.

use std::io;

/// Errors from starting a server or connecting a client.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind the listener.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: io::Error,
    },

    /// Host name resolution failed or returned no address.
    #[error("failed to resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    /// The server is already running.
    #[error("server already running")]
    AlreadyRunning,

    /// The client is already connected or connecting.
    #[error("client already connected")]
    AlreadyConnected,

    /// The configuration is unusable.
    #[error("invalid transport configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reasons a send was refused. The write is never partially issued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// No connection with that id, or the client is not connected.
    #[error("not connected")]
    NotConnected,

    /// Empty payloads cannot be framed.
    #[error("payload is empty")]
    EmptyPayload,

    /// The payload exceeds the frame limit.
    #[error("payload too large ({len} bytes, max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// No free chunks for the frame. The connection has been closed.
    #[error("buffer pool exhausted ({needed} chunks needed, {available} free)")]
    PoolExhausted { needed: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, TransportError>;
