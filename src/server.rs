//! TCP server accepting many framed connections.
//!
//! The server keeps exactly one accept outstanding on its listener. Each
//! accepted connection gets the next connection id, is registered, reported
//! as `Connected` and handed to the shared receive/send core. The embedding
//! application drains events with [`Server::poll_event`] and answers with
//! [`Server::send`].

use crate::config::TransportConfig;
use crate::error::{Result, SendError, TransportError};
use crate::event::{ConnectionId, Event, EventQueue};
use crate::runtime::completion::{Completion, CompletionHandler, Flow};
use crate::runtime::connection::{CloseReason, Connection, ConnectionRegistry, IdAllocator};
use crate::runtime::link::{self, Link};
use crate::runtime::token::OpType;
use crate::runtime::{build_runtime, create_listener, shutdown_runtime, BufferPool};
use chrono::{DateTime, Local};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for worker threads to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Server instance
pub struct Server {
    config: TransportConfig,
    shared: Arc<ServerShared>,
    runtime: Option<Runtime>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// State reachable from completion handlers.
struct ServerShared {
    this: Weak<ServerShared>,
    link: Link,
    registry: ConnectionRegistry,
    ids: IdAllocator,
    accepting: AtomicBool,
}

impl Server {
    /// Create a server. The buffer pool is allocated here, once.
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::with_ids(config, IdAllocator::new())
    }

    fn with_ids(config: TransportConfig, ids: IdAllocator) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new_cyclic(|this| ServerShared {
            this: this.clone(),
            link: Link::new(&config, Arc::new(EventQueue::new())),
            registry: ConnectionRegistry::new(config.max_connections),
            ids,
            accepting: AtomicBool::new(false),
        });

        Ok(Server {
            config,
            shared,
            runtime: None,
            accept_task: None,
            local_addr: None,
        })
    }

    /// Bind the listener on `port` and start accepting.
    ///
    /// Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub fn start(&mut self, port: u16) -> Result<SocketAddr> {
        if self.runtime.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        let addr = SocketAddr::new(self.config.bind_address, port);
        let listener = create_listener(addr, self.config.backlog)
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let workers = self.config.workers();
        let runtime = build_runtime(workers, "framewire-server")?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };

        self.shared.accepting.store(true, Ordering::Release);
        self.accept_task = Some(runtime.spawn(accept_loop(Arc::clone(&self.shared), listener)));
        self.runtime = Some(runtime);
        self.local_addr = Some(local_addr);

        info!(
            addr = %local_addr,
            workers,
            chunks = self.shared.link.pool().capacity(),
            chunk_size = self.shared.link.pool().chunk_size(),
            "Server listening"
        );
        Ok(local_addr)
    }

    /// Stop accepting, close every connection and shut the workers down.
    ///
    /// Every registered connection is reported as `Disconnected`. Outside an
    /// async context this waits briefly for the workers to finish.
    pub fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        self.shared.accepting.store(false, Ordering::Release);
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.shared.close_all();

        shutdown_runtime(runtime, SHUTDOWN_TIMEOUT);

        // An accept racing with the first pass may have registered late
        self.shared.close_all();
        self.shared.link.dispatcher().reset();
        self.local_addr = None;

        info!("Server stopped");
    }

    /// Queue `payload` on connection `id`. Returns `false` if the connection
    /// is unknown or the send was refused.
    pub fn send(&self, id: ConnectionId, payload: &[u8]) -> bool {
        match self.try_send(id, payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(conn_id = %id, error = %e, "Send refused");
                false
            }
        }
    }

    /// Like [`send`](Self::send), reporting why the send was refused.
    pub fn try_send(&self, id: ConnectionId, payload: &[u8]) -> std::result::Result<(), SendError> {
        let conn = self.shared.registry.get(id).ok_or(SendError::NotConnected)?;
        link::send(self.shared.as_ref(), &conn, payload)
    }

    /// Close connection `id`. Returns `false` if it is unknown.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        match self.shared.registry.get(id) {
            Some(conn) => {
                self.shared.close(&conn, CloseReason::Local);
                true
            }
            None => false,
        }
    }

    /// Next pending event, if any.
    pub fn poll_event(&self) -> Option<Event> {
        self.shared.link.events().poll()
    }

    /// The event queue, for draining from another thread.
    pub fn events(&self) -> Arc<EventQueue> {
        Arc::clone(self.shared.link.events())
    }

    /// IP address of the peer of connection `id`.
    pub fn remote_address(&self, id: ConnectionId) -> Option<String> {
        self.remote_addr(id).map(|addr| addr.ip().to_string())
    }

    pub fn remote_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.shared.registry.get(id).map(|conn| conn.remote_addr())
    }

    /// When connection `id` was accepted.
    pub fn connected_at(&self, id: ConnectionId) -> Option<DateTime<Local>> {
        self.shared.registry.get(id).map(|conn| conn.connected_at())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_active(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Ids of the registered connections, ascending.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.registry.ids()
    }

    pub fn pool(&self) -> &BufferPool {
        self.shared.link.pool()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ServerShared {
    fn close_all(&self) {
        for conn in self.registry.drain() {
            self.close(&conn, CloseReason::Shutdown);
        }
    }

    /// Register a new connection and start its sequences.
    fn establish(&self, stream: TcpStream, remote: SocketAddr) -> Flow {
        // Refused connections must not consume ids, so every check that can
        // refuse runs before the id is taken.
        if self.registry.is_full() {
            warn!(peer = %remote, "Connection limit reached, refusing connection");
            return Flow::Continue;
        }

        let Some(chunk) = self.link.assign_receive_chunk() else {
            error!(peer = %remote, "No chunk free for receive, refusing connection");
            return Flow::Continue;
        };

        let Some(id) = self.ids.next() else {
            error!(peer = %remote, "Connection ids exhausted, no longer accepting");
            self.accepting.store(false, Ordering::Release);
            return Flow::Close;
        };

        let Some(this) = self.this.upgrade() else {
            return Flow::Close;
        };

        let established = self.link.establish(id, stream, remote, chunk);
        if !self.registry.insert(Arc::clone(&established.conn)) {
            warn!(conn_id = %id, peer = %remote, "Connection limit reached, closing");
            return Flow::Continue;
        }

        debug!(conn_id = %id, peer = %remote, "Accepted connection");
        self.link.events().push(Event::Connected { id });
        link::spawn_connection(this, established);
        Flow::Continue
    }
}

impl CompletionHandler for ServerShared {
    fn link(&self) -> &Link {
        &self.link
    }

    fn close(&self, conn: &Connection, reason: CloseReason) {
        if !conn.mark_closed() {
            return;
        }
        self.registry.remove(conn.id());

        match reason {
            CloseReason::Protocol(_) | CloseReason::PoolExhausted | CloseReason::TaskFailed => {
                warn!(conn_id = %conn.id(), peer = %conn.remote_addr(), %reason, "Connection closed");
            }
            _ => {
                debug!(conn_id = %conn.id(), peer = %conn.remote_addr(), %reason, "Connection closed");
            }
        }

        self.link.events().push(Event::Disconnected { id: conn.id() });
    }

    fn on_accept(&self, result: io::Result<(TcpStream, SocketAddr)>) -> Flow {
        let (stream, remote) = match result {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                return Flow::Continue;
            }
        };

        if !self.accepting.load(Ordering::Acquire) {
            return Flow::Close;
        }

        self.establish(stream, remote)
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    let dispatcher = shared.link.dispatcher();

    loop {
        let token = dispatcher.submit(OpType::Accept);
        let result = listener.accept().await;
        if dispatcher.dispatch(token, Completion::Accept(result), shared.as_ref()) == Flow::Close {
            break;
        }
    }

    debug!("Accept loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Instant;

    fn config() -> TransportConfig {
        TransportConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            chunk_count: 64,
            chunk_size: 256,
            worker_threads: 2,
            ..TransportConfig::default()
        }
    }

    fn wait_event(server: &Server) -> Event {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(event) = server.poll_event() {
                return event;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for an event");
    }

    #[test]
    fn test_start_twice_fails() {
        let mut server = Server::new(config()).unwrap();
        assert!(!server.is_active());

        server.start(0).unwrap();
        assert!(server.is_active());
        assert!(matches!(server.start(0), Err(TransportError::AlreadyRunning)));

        server.stop();
        assert!(!server.is_active());
        assert_eq!(server.local_addr(), None);
    }

    #[test]
    fn test_invalid_config() {
        let result = Server::new(TransportConfig {
            chunk_count: 0,
            ..config()
        });
        assert!(matches!(result, Err(TransportError::Config(_))));
    }

    #[test]
    fn test_unknown_connection() {
        let mut server = Server::new(config()).unwrap();
        server.start(0).unwrap();

        let id = ConnectionId::new(42);
        assert!(!server.send(id, b"hello"));
        assert_eq!(server.try_send(id, b"hello"), Err(SendError::NotConnected));
        assert!(!server.disconnect(id));
        assert_eq!(server.remote_address(id), None);
        assert_eq!(server.connected_at(id), None);
    }

    #[test]
    fn test_accept_registers_and_echoes() {
        let mut server = Server::new(config()).unwrap();
        let addr = server.start(0).unwrap();

        let mut peer = std::net::TcpStream::connect(addr).unwrap();
        let id = match wait_event(&server) {
            Event::Connected { id } => id,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(id, ConnectionId::new(1));
        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.remote_address(id).as_deref(), Some("127.0.0.1"));
        assert!(server.connected_at(id).unwrap() <= Local::now());

        peer.write_all(&[0, 0, 0, 3, b'a', b'b', b'c']).unwrap();
        assert_eq!(
            wait_event(&server),
            Event::Data {
                id,
                payload: bytes::Bytes::from_static(b"abc")
            }
        );

        assert!(server.send(id, b"xyz"));
        let mut reply = [0u8; 7];
        peer.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, &[0, 0, 0, 3, b'x', b'y', b'z']);

        assert!(server.disconnect(id));
        assert_eq!(wait_event(&server), Event::Disconnected { id });
        assert_eq!(server.connection_count(), 0);
        assert!(!server.send(id, b"late"));
    }

    #[test]
    fn test_stop_reports_every_connection() {
        let mut server = Server::new(config()).unwrap();
        let addr = server.start(0).unwrap();

        let _peers: Vec<_> = (0..3)
            .map(|_| std::net::TcpStream::connect(addr).unwrap())
            .collect();
        for _ in 0..3 {
            assert!(matches!(wait_event(&server), Event::Connected { .. }));
        }

        server.stop();

        let mut disconnected: Vec<_> = std::iter::from_fn(|| server.poll_event())
            .map(|event| match event {
                Event::Disconnected { id } => id.get(),
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        disconnected.sort_unstable();
        assert_eq!(disconnected, vec![1, 2, 3]);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.pool().available(), server.pool().capacity());
    }

    #[test]
    fn test_id_exhaustion_stops_accepting() {
        let mut server = Server::with_ids(config(), IdAllocator::with_range(1, 2)).unwrap();
        let addr = server.start(0).unwrap();

        let _first = std::net::TcpStream::connect(addr).unwrap();
        assert_eq!(
            wait_event(&server),
            Event::Connected {
                id: ConnectionId::new(1)
            }
        );

        // Accepted by the kernel, then dropped without an id
        let mut second = std::net::TcpStream::connect(addr).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(second.read(&mut buf).unwrap(), 0);
        assert_eq!(server.poll_event(), None);
        assert_eq!(server.connection_count(), 1);

        // The accept loop has ended and the listener with it
        let deadline = Instant::now() + Duration::from_secs(5);
        while std::net::TcpStream::connect(addr).is_ok() {
            assert!(Instant::now() < deadline, "listener still open");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.poll_event(), None);
    }

    #[test]
    fn test_connection_limit_keeps_ids() {
        let mut server = Server::new(TransportConfig {
            max_connections: 1,
            ..config()
        })
        .unwrap();
        let addr = server.start(0).unwrap();

        let _first = std::net::TcpStream::connect(addr).unwrap();
        let first = match wait_event(&server) {
            Event::Connected { id } => id,
            other => panic!("unexpected event {:?}", other),
        };

        let mut refused = std::net::TcpStream::connect(addr).unwrap();
        refused.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(refused.read(&mut buf).unwrap(), 0);
        assert_eq!(server.connection_count(), 1);

        assert!(server.disconnect(first));
        assert_eq!(wait_event(&server), Event::Disconnected { id: first });

        let _third = std::net::TcpStream::connect(addr).unwrap();
        assert_eq!(
            wait_event(&server),
            Event::Connected {
                id: ConnectionId::new(2)
            }
        );
    }

    #[tokio::test]
    async fn test_drop_inside_async_context() {
        let mut server = Server::new(config()).unwrap();
        let addr = server.start(0).unwrap();
        let _peer = tokio::net::TcpStream::connect(addr).await.unwrap();

        drop(server);
    }

    #[test]
    fn test_restart_keeps_ids_increasing() {
        let mut server = Server::new(config()).unwrap();

        let addr = server.start(0).unwrap();
        let _first = std::net::TcpStream::connect(addr).unwrap();
        assert_eq!(
            wait_event(&server),
            Event::Connected {
                id: ConnectionId::new(1)
            }
        );
        server.stop();
        assert!(matches!(wait_event(&server), Event::Disconnected { .. }));

        let addr = server.start(0).unwrap();
        let _second = std::net::TcpStream::connect(addr).unwrap();
        assert_eq!(
            wait_event(&server),
            Event::Connected {
                id: ConnectionId::new(2)
            }
        );
    }
}
