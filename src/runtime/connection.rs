//! Connection state for TCP connections.
//!
//! A connection is split along its two serialized sequences:
//! - `Connection` holds what both sides share (socket, identity, the send
//!   queue, the closed flag) and lives in an `Arc`.
//! - `Inbound` holds the receive chunk and the frame accumulator. It is owned
//!   by the connection's receive sequence and never shared.

use crate::event::ConnectionId;
use crate::frame::{FrameDecoder, FrameError};
use crate::runtime::buffer::ChunkLease;
use bytes::Bytes;
use chrono::{DateTime, Local};
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::SockRef;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Why a connection was closed.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    #[error("closed by peer")]
    RemoteClosed,

    #[error("network error: {0}")]
    Network(io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),

    #[error("buffer pool exhausted")]
    PoolExhausted,

    #[error("disconnected locally")]
    Local,

    #[error("transport stopped")]
    Shutdown,

    #[error("connection task failed")]
    TaskFailed,
}

/// Shared state of one established connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    remote: SocketAddr,
    connected_at: DateTime<Local>,
    /// Frames waiting for the send sequence. Taken on close.
    outbound: Mutex<Option<UnboundedSender<ChunkLease>>>,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap an established stream. Returns the receiving end of the send
    /// queue, which belongs to the connection's send sequence.
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> (Self, UnboundedReceiver<ChunkLease>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            id,
            stream,
            remote,
            connected_at: Local::now(),
            outbound: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        };
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a filled lease for the send sequence.
    ///
    /// Hands the lease back if the connection is closing.
    pub fn enqueue(&self, lease: ChunkLease) -> Result<(), ChunkLease> {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(lease).map_err(|e| e.0),
            None => Err(lease),
        }
    }

    /// Shut the socket down in both directions.
    ///
    /// The pending receive then completes with end-of-stream and runs the
    /// normal close path.
    pub fn shutdown(&self) {
        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            tracing::trace!(conn_id = %self.id, error = %e, "Shutdown failed");
        }
    }

    /// Mark the connection closed, shut the socket down and stop accepting
    /// sends.
    ///
    /// Returns `true` for exactly one caller; everyone else sees `false`.
    pub fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.outbound.lock().take();
        self.shutdown();
        true
    }

    /// Receive into `buf`, waiting until the socket is readable.
    pub async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write every byte of `lease`, resuming after partial writes.
    pub async fn send_lease(&self, lease: &ChunkLease) -> io::Result<()> {
        let total = lease.len();
        let mut written = 0;

        while written < total {
            self.stream.writable().await?;
            match self.stream.try_write_vectored(&lease.io_slices(written)) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Receive-side state of a connection.
///
/// Holds the pool chunk assigned to the connection's in-flight receive and
/// the frame accumulator. Dropping it returns the chunk.
#[derive(Debug)]
pub struct Inbound {
    chunk: ChunkLease,
    decoder: FrameDecoder,
}

impl Inbound {
    pub fn new(chunk: ChunkLease, max_frame: usize) -> Self {
        let capacity = chunk.capacity();
        Self {
            chunk,
            decoder: FrameDecoder::with_capacity(max_frame, capacity),
        }
    }

    /// Buffer the next receive writes into.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.chunk.first_mut()
    }

    /// Decode the `n` bytes just received into the buffer.
    pub fn decode(&mut self, n: usize, emit: impl FnMut(Bytes)) -> Result<usize, FrameError> {
        let received = &self.chunk.first_mut()[..n];
        self.decoder.decode(received, emit)
    }

    /// Bytes received but not yet complete frames.
    pub fn buffered(&self) -> usize {
        self.decoder.buffered()
    }
}

/// Allocator of connection ids.
///
/// Ids start at 1, strictly increase and are never reused. Once the limit is
/// reached every further call fails.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU32,
    limit: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::with_range(1, u32::MAX)
    }

    /// Allocator handing out `start..limit`.
    pub fn with_range(start: u32, limit: u32) -> Self {
        debug_assert!(start > 0, "connection ids are positive");
        Self {
            next: AtomicU32::new(start),
            limit,
        }
    }

    /// Next id, or `None` once the id space is exhausted.
    pub fn next(&self) -> Option<ConnectionId> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .ok()
            .map(ConnectionId::new)
    }

    pub fn is_exhausted(&self) -> bool {
        self.next.load(Ordering::Acquire) >= self.limit
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of active connections.
///
/// Insert, lookup and remove are safe from any worker thread without external
/// locking.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: DashMap::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `false` if the registry is at capacity.
    pub fn insert(&self, conn: Arc<Connection>) -> bool {
        if self.is_full() {
            return false;
        }
        self.connections.insert(conn.id(), conn);
        true
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Snapshot of the registered ids, in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Remove and return every connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }
}
