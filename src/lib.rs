//! framewire: length-prefixed TCP transport with pooled wire buffers.
//!
//! A [`Server`] accepts many connections and a [`Client`] holds one outbound
//! connection. Both exchange opaque payloads framed as a 4-byte big-endian
//! length followed by the payload bytes, and report what happens as
//! [`Event`]s the application drains at its own pace.
//!
//! Features:
//! - Completion-driven receive and send on a multi-threaded runtime
//! - Fixed-capacity chunk pool for all wire buffers, with backpressure
//! - Reassembly of frames split or coalesced across reads
//! - Configuration via CLI arguments or TOML file

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod runtime;
pub mod server;

pub use client::Client;
pub use config::{AddressSelection, TransportConfig};
pub use error::{SendError, TransportError};
pub use event::{ConnectionId, Event, EventQueue};
pub use frame::{encode_header, FrameDecoder, FrameError};
pub use runtime::{BufferPool, ChunkLease};
pub use server::Server;
