//! Completion routing.
//!
//! Every asynchronous operation is registered as pending before it is issued
//! and dispatched to its handler when it finishes. Handlers run inline on the
//! worker thread that observed the completion, so they must stay short and
//! never block; anything heavier belongs to the event consumer.

use crate::runtime::buffer::ChunkLease;
use crate::runtime::connection::{CloseReason, Connection, Inbound};
use crate::runtime::link::Link;
use crate::runtime::token::{OpToken, OpType, TokenAllocator};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{error, warn};

/// What the issuing sequence does after a completion was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Issue the next operation.
    Continue,
    /// Stop issuing operations on this sequence.
    Close,
}

/// A finished operation and its result.
pub enum Completion<'a> {
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Connect(io::Result<(TcpStream, SocketAddr)>),
    Receive {
        conn: &'a Connection,
        inbound: &'a mut Inbound,
        result: io::Result<usize>,
    },
    Send {
        conn: &'a Connection,
        lease: ChunkLease,
        result: io::Result<()>,
    },
}

impl Completion<'_> {
    /// Operation this completion finishes.
    pub fn op(&self) -> OpType {
        match self {
            Completion::Accept(_) => OpType::Accept,
            Completion::Connect(_) => OpType::Connect,
            Completion::Receive { conn, .. } => OpType::Receive { conn_id: conn.id() },
            Completion::Send { conn, .. } => OpType::Send { conn_id: conn.id() },
        }
    }
}

/// Completion handling shared by the server and the client.
///
/// Both roles run the same receive and send handlers on top of their [`Link`];
/// they differ in how a connection is torn down and in which of accept or
/// connect they issue.
pub trait CompletionHandler: Send + Sync + 'static {
    /// The receive/send/framing core.
    fn link(&self) -> &Link;

    /// Tear a connection down and report it to the application.
    ///
    /// Must be idempotent: only the first call for a connection has effect.
    fn close(&self, conn: &Connection, reason: CloseReason);

    fn on_accept(&self, result: io::Result<(TcpStream, SocketAddr)>) -> Flow {
        drop(result);
        error!("Accept completed on an endpoint that does not listen");
        Flow::Close
    }

    fn on_connect(&self, result: io::Result<(TcpStream, SocketAddr)>) -> Flow {
        drop(result);
        error!("Connect completed on an endpoint that does not connect");
        Flow::Close
    }

    /// Append received bytes, emit complete frames, or close.
    fn on_receive(
        &self,
        conn: &Connection,
        inbound: &mut Inbound,
        result: io::Result<usize>,
    ) -> Flow {
        match self.link().receive_completed(conn, inbound, result) {
            Ok(()) => Flow::Continue,
            Err(reason) => {
                self.close(conn, reason);
                Flow::Close
            }
        }
    }

    /// Return the send's lease to the pool; close on failure.
    fn on_send(&self, conn: &Connection, lease: ChunkLease, result: io::Result<()>) -> Flow {
        match self.link().send_completed(conn, lease, result) {
            Ok(()) => Flow::Continue,
            Err(reason) => {
                self.close(conn, reason);
                Flow::Close
            }
        }
    }
}

/// Tracks pending operations and routes completions by operation kind.
pub struct CompletionDispatcher {
    tokens: Mutex<TokenAllocator>,
}

impl CompletionDispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: Mutex::new(TokenAllocator::new(capacity)),
        }
    }

    /// Register an operation that is about to be issued.
    pub fn submit(&self, op: OpType) -> OpToken {
        self.tokens.lock().alloc(op)
    }

    /// Complete the operation behind `token` and hand it to `handler`.
    ///
    /// A token that is no longer pending is ignored; any lease carried by
    /// its completion is returned to the pool.
    pub fn dispatch<H>(&self, token: OpToken, completion: Completion<'_>, handler: &H) -> Flow
    where
        H: CompletionHandler + ?Sized,
    {
        let Some(op) = self.tokens.lock().free(token) else {
            warn!(?token, op = ?completion.op(), "Unknown token in completion");
            return Flow::Close;
        };
        debug_assert_eq!(op, completion.op(), "completion does not match its token");

        match completion {
            Completion::Accept(result) => handler.on_accept(result),
            Completion::Connect(result) => handler.on_connect(result),
            Completion::Receive {
                conn,
                inbound,
                result,
            } => handler.on_receive(conn, inbound, result),
            Completion::Send {
                conn,
                lease,
                result,
            } => handler.on_send(conn, lease, result),
        }
    }

    /// Number of pending operations.
    pub fn in_flight(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Forget every pending operation. Only valid once nothing can complete.
    pub fn reset(&self) {
        self.tokens.lock().clear();
    }
}
