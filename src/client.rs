//! Client holding a single outbound framed connection.
//!
//! Runs the same receive/send core as the server. Events always carry
//! [`ConnectionId::CLIENT`].

use crate::config::TransportConfig;
use crate::error::{Result, SendError, TransportError};
use crate::event::{ConnectionId, Event, EventQueue};
use crate::runtime::completion::{Completion, CompletionHandler, Flow};
use crate::runtime::connection::{CloseReason, Connection};
use crate::runtime::link::{self, Link};
use crate::runtime::token::OpType;
use crate::runtime::{build_runtime, shutdown_runtime, BufferPool};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

pub struct Client {
    config: TransportConfig,
    shared: Arc<ClientShared>,
    runtime: Option<Runtime>,
}

struct ClientShared {
    this: Weak<ClientShared>,
    link: Link,
    conn: Mutex<Option<Arc<Connection>>>,
    connecting: AtomicBool,
}

impl Client {
    /// Create a client. The buffer pool and the worker threads are set up
    /// here, once.
    pub fn new(config: TransportConfig) -> Result<Self> {
        config.validate()?;

        let runtime = build_runtime(config.workers(), "framewire-client")?;
        let shared = Arc::new_cyclic(|this| ClientShared {
            this: this.clone(),
            link: Link::new(&config, Arc::new(EventQueue::new())),
            conn: Mutex::new(None),
            connecting: AtomicBool::new(false),
        });

        Ok(Client {
            config,
            shared,
            runtime: Some(runtime),
        })
    }

    /// Resolve `host` and start connecting to it.
    ///
    /// Returns once the connect is issued. Success shows up as `Connected`,
    /// failure as `Disconnected`. Must not be called from within an async
    /// context.
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        };
        if self.is_connected() || self.shared.connecting.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyConnected);
        }

        let resolved = runtime
            .block_on(tokio::net::lookup_host((host, port)))
            .ok()
            .and_then(|addrs| self.config.address_selection.pick(addrs));
        let Some(addr) = resolved else {
            self.shared.connecting.store(false, Ordering::Release);
            return Err(TransportError::Resolve {
                host: host.to_string(),
                port,
            });
        };

        debug!(host, addr = %addr, "Connecting");
        let shared = Arc::clone(&self.shared);
        runtime.spawn(async move {
            let dispatcher = shared.link.dispatcher();
            let token = dispatcher.submit(OpType::Connect);
            let result = TcpStream::connect(addr).await.map(|stream| (stream, addr));
            dispatcher.dispatch(token, Completion::Connect(result), shared.as_ref());
        });

        Ok(())
    }

    /// Close the connection. Returns `false` if there is none.
    pub fn disconnect(&self) -> bool {
        let conn = self.shared.conn.lock().clone();
        match conn {
            Some(conn) => {
                self.shared.close(&conn, CloseReason::Local);
                true
            }
            None => false,
        }
    }

    /// Queue `payload` on the connection. Returns `false` if not connected or
    /// the send was refused.
    pub fn send(&self, payload: &[u8]) -> bool {
        match self.try_send(payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Send refused");
                false
            }
        }
    }

    /// Like [`send`](Self::send), reporting why the send was refused.
    pub fn try_send(&self, payload: &[u8]) -> std::result::Result<(), SendError> {
        let conn = self.shared.conn.lock().clone();
        let conn = conn.ok_or(SendError::NotConnected)?;
        link::send(self.shared.as_ref(), &conn, payload)
    }

    /// Next pending event, if any.
    pub fn poll_event(&self) -> Option<Event> {
        self.shared.link.events().poll()
    }

    /// The event queue, for draining from another thread.
    pub fn events(&self) -> Arc<EventQueue> {
        Arc::clone(self.shared.link.events())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.conn.lock().is_some()
    }

    pub fn is_connecting(&self) -> bool {
        self.shared.connecting.load(Ordering::Acquire)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.conn.lock().as_ref().map(|conn| conn.remote_addr())
    }

    pub fn pool(&self) -> &BufferPool {
        self.shared.link.pool()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
        if let Some(runtime) = self.runtime.take() {
            shutdown_runtime(runtime, Duration::from_secs(1));
        }
    }
}

impl ClientShared {
    fn connect_failed(&self, reason: &str) -> Flow {
        self.connecting.store(false, Ordering::Release);
        self.link.events().push(Event::Disconnected {
            id: ConnectionId::CLIENT,
        });
        debug!(reason, "Connect failed");
        Flow::Close
    }
}

impl CompletionHandler for ClientShared {
    fn link(&self) -> &Link {
        &self.link
    }

    fn close(&self, conn: &Connection, reason: CloseReason) {
        if !conn.mark_closed() {
            return;
        }

        {
            let mut current = self.conn.lock();
            if current
                .as_ref()
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), conn))
            {
                *current = None;
            }
        }

        info!(peer = %conn.remote_addr(), %reason, "Disconnected");
        self.link.events().push(Event::Disconnected { id: conn.id() });
    }

    fn on_connect(&self, result: io::Result<(TcpStream, SocketAddr)>) -> Flow {
        let (stream, remote) = match result {
            Ok(connected) => connected,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                return self.connect_failed("connect error");
            }
        };

        let Some(chunk) = self.link.assign_receive_chunk() else {
            warn!(peer = %remote, "No chunk free for receive");
            return self.connect_failed("pool exhausted");
        };
        let Some(this) = self.this.upgrade() else {
            return self.connect_failed("client dropped");
        };

        let established = self
            .link
            .establish(ConnectionId::CLIENT, stream, remote, chunk);
        *self.conn.lock() = Some(Arc::clone(&established.conn));
        self.connecting.store(false, Ordering::Release);

        info!(peer = %remote, "Connected");
        self.link.events().push(Event::Connected {
            id: ConnectionId::CLIENT,
        });
        link::spawn_connection(this, established);
        Flow::Continue
    }
}
