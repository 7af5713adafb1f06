//! Completion-driven transport runtime.
//!
//! Each server or client owns a multi-threaded tokio runtime whose workers
//! deliver completions. The pieces shared by both roles:
//! - `BufferPool`: fixed-capacity chunk pool for wire buffers
//! - `Connection`: per-connection state and the id registry
//! - `CompletionDispatcher`: operation tracking and completion routing
//! - `Link`: the receive/send/framing core built on the above

pub mod buffer;
pub mod completion;
pub mod connection;
pub mod link;
pub mod token;

pub use buffer::{BufferPool, ChunkLease};
pub use completion::{Completion, CompletionDispatcher, CompletionHandler, Flow};
pub use connection::{CloseReason, Connection, ConnectionRegistry, IdAllocator, Inbound};
pub use link::{Established, Link};
pub use token::{OpToken, OpType, TokenAllocator};

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};

/// Build the worker pool that runs a role's completions.
pub(crate) fn build_runtime(workers: usize, name: &str) -> io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .thread_name(name)
        .enable_all()
        .build()
}

/// Shut a role's workers down.
///
/// Waits up to `timeout` for tasks to stop, unless called from within an
/// async context, where blocking is not allowed and the workers are left to
/// stop in the background.
pub(crate) fn shutdown_runtime(runtime: Runtime, timeout: Duration) {
    if Handle::try_current().is_ok() {
        runtime.shutdown_background();
    } else {
        runtime.shutdown_timeout(timeout);
    }
}

/// Create a non-blocking listener with address reuse.
pub(crate) fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
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
    socket.listen(backlog)?;

    Ok(socket.into())
}
