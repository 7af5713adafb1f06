//! Receive/send/framing core shared by the server and the client.
//!
//! A `Link` owns the role's buffer pool, event queue and completion
//! dispatcher. Every established connection runs two sequences on the
//! runtime:
//! - the receive loop keeps exactly one receive outstanding and decodes
//!   frames into `Data` events;
//! - the send loop drains the connection's send queue one lease at a time,
//!   so frames leave in the order they were framed.
//!
//! A third task supervises both and turns a panic into a normal close.

use crate::config::TransportConfig;
use crate::error::SendError;
use crate::event::{ConnectionId, Event, EventQueue};
use crate::frame::{encode_header, HEADER_SIZE};
use crate::runtime::buffer::{BufferPool, ChunkLease};
use crate::runtime::completion::{Completion, CompletionDispatcher, CompletionHandler, Flow};
use crate::runtime::connection::{CloseReason, Connection, Inbound};
use crate::runtime::token::OpType;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinError;
use tracing::{debug, error, trace, warn};

pub struct Link {
    pool: BufferPool,
    events: Arc<EventQueue>,
    dispatcher: CompletionDispatcher,
    max_frame: usize,
    nodelay: bool,
}

/// A connection ready to have its sequences started.
pub struct Established {
    pub conn: Arc<Connection>,
    pub inbound: Inbound,
    pub outbound: UnboundedReceiver<ChunkLease>,
}

impl Link {
    pub fn new(config: &TransportConfig, events: Arc<EventQueue>) -> Self {
        Self {
            pool: BufferPool::new(config.chunk_count, config.chunk_size),
            events,
            dispatcher: CompletionDispatcher::new(config.chunk_count.min(4096)),
            max_frame: config.max_frame_size,
            nodelay: config.nodelay,
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    pub fn dispatcher(&self) -> &CompletionDispatcher {
        &self.dispatcher
    }

    /// Chunk for a new connection's receive buffer.
    pub fn assign_receive_chunk(&self) -> Option<ChunkLease> {
        self.pool.assign(self.pool.chunk_size())
    }

    /// Wrap a freshly accepted or connected stream.
    pub fn establish(
        &self,
        id: ConnectionId,
        stream: TcpStream,
        remote: SocketAddr,
        chunk: ChunkLease,
    ) -> Established {
        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(conn_id = %id, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let (conn, outbound) = Connection::new(id, stream, remote);
        Established {
            conn: Arc::new(conn),
            inbound: Inbound::new(chunk, self.max_frame),
            outbound,
        }
    }

    /// Fold a finished receive into the connection's accumulator and emit
    /// every complete frame.
    pub fn receive_completed(
        &self,
        conn: &Connection,
        inbound: &mut Inbound,
        result: io::Result<usize>,
    ) -> Result<(), CloseReason> {
        if conn.is_closed() {
            return Err(CloseReason::Local);
        }

        let n = match result {
            Ok(0) => return Err(CloseReason::RemoteClosed),
            Ok(n) => n,
            Err(e) => return Err(CloseReason::Network(e)),
        };

        let id = conn.id();
        let events = &self.events;
        let frames = inbound.decode(n, |payload| events.push(Event::Data { id, payload }))?;

        trace!(conn_id = %id, bytes = n, frames, buffered = inbound.buffered(), "Received");
        Ok(())
    }

    /// Return a finished send's chunks to the pool.
    pub fn send_completed(
        &self,
        conn: &Connection,
        lease: ChunkLease,
        result: io::Result<()>,
    ) -> Result<(), CloseReason> {
        let len = lease.len();
        drop(lease);

        match result {
            Ok(()) => {
                trace!(conn_id = %conn.id(), bytes = len, "Sent");
                Ok(())
            }
            Err(e) => Err(CloseReason::Network(e)),
        }
    }

    /// Frame `payload` into pool chunks and queue it on `conn`.
    ///
    /// Nothing is queued when this fails.
    pub fn frame(&self, conn: &Connection, payload: &[u8]) -> Result<(), SendError> {
        if conn.is_closed() {
            return Err(SendError::NotConnected);
        }
        if payload.is_empty() {
            return Err(SendError::EmptyPayload);
        }
        if payload.len() > self.max_frame {
            return Err(SendError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_frame,
            });
        }

        let header = encode_header(payload.len());
        let Some(lease) = self.pool.assign_with(&[&header, payload]) else {
            return Err(SendError::PoolExhausted {
                needed: self.pool.chunks_for(HEADER_SIZE + payload.len()),
                available: self.pool.available(),
            });
        };

        // A lease handed back means the connection closed meanwhile; dropping
        // it returns the chunks.
        conn.enqueue(lease).map_err(|_| SendError::NotConnected)
    }
}

/// Frame and queue `payload`, closing the connection if the pool is out of
/// chunks.
pub fn send<H>(handler: &H, conn: &Connection, payload: &[u8]) -> Result<(), SendError>
where
    H: CompletionHandler + ?Sized,
{
    let result = handler.link().frame(conn, payload);
    if let Err(SendError::PoolExhausted { needed, available }) = result {
        warn!(conn_id = %conn.id(), needed, available, "No chunks free for send, closing");
        handler.close(conn, CloseReason::PoolExhausted);
    }
    result
}

/// Start the receive and send sequences of an established connection.
///
/// Must be called from within the runtime.
pub fn spawn_connection<H: CompletionHandler>(handler: Arc<H>, established: Established) {
    let Established {
        conn,
        inbound,
        outbound,
    } = established;

    let mut receive = tokio::spawn(receive_loop(
        Arc::clone(&handler),
        Arc::clone(&conn),
        inbound,
    ));
    let mut send = tokio::spawn(send_loop(Arc::clone(&handler), Arc::clone(&conn), outbound));

    tokio::spawn(async move {
        // Close as soon as either task fails; the survivor only stops once
        // the connection is closed.
        let other = tokio::select! {
            r = &mut receive => {
                task_finished(handler.as_ref(), &conn, r);
                send
            }
            s = &mut send => {
                task_finished(handler.as_ref(), &conn, s);
                receive
            }
        };
        task_finished(handler.as_ref(), &conn, other.await);
    });
}

fn task_finished<H>(handler: &H, conn: &Connection, result: Result<(), JoinError>)
where
    H: CompletionHandler,
{
    if let Err(e) = result {
        if e.is_panic() {
            error!(conn_id = %conn.id(), "Connection task panicked");
            handler.close(conn, CloseReason::TaskFailed);
        }
    }
}

async fn receive_loop<H: CompletionHandler>(
    handler: Arc<H>,
    conn: Arc<Connection>,
    mut inbound: Inbound,
) {
    let dispatcher = handler.link().dispatcher();

    // One receive outstanding; the next is issued only once this one has
    // been processed.
    loop {
        let token = dispatcher.submit(OpType::Receive { conn_id: conn.id() });
        let result = conn.receive(inbound.buffer_mut()).await;

        let completion = Completion::Receive {
            conn: &conn,
            inbound: &mut inbound,
            result,
        };
        if dispatcher.dispatch(token, completion, handler.as_ref()) == Flow::Close {
            break;
        }
    }
}

async fn send_loop<H: CompletionHandler>(
    handler: Arc<H>,
    conn: Arc<Connection>,
    mut outbound: UnboundedReceiver<ChunkLease>,
) {
    let dispatcher = handler.link().dispatcher();

    while let Some(lease) = outbound.recv().await {
        let token = dispatcher.submit(OpType::Send { conn_id: conn.id() });
        let result = conn.send_lease(&lease).await;

        let completion = Completion::Send {
            conn: &conn,
            lease,
            result,
        };
        if dispatcher.dispatch(token, completion, handler.as_ref()) == Flow::Close {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Echo {
        link: Link,
        closes: Mutex<Vec<String>>,
    }

    impl CompletionHandler for Echo {
        fn link(&self) -> &Link {
            &self.link
        }

        fn close(&self, conn: &Connection, reason: CloseReason) {
            if conn.mark_closed() {
                self.closes.lock().push(reason.to_string());
                self.link.events().push(Event::Disconnected { id: conn.id() });
            }
        }
    }

    fn handler(chunk_count: usize, chunk_size: usize) -> Arc<Echo> {
        let config = TransportConfig {
            chunk_count,
            chunk_size,
            max_frame_size: 1024,
            ..TransportConfig::default()
        };
        Arc::new(Echo {
            link: Link::new(&config, Arc::new(EventQueue::new())),
            closes: Mutex::new(Vec::new()),
        })
    }

    async fn established(handler: &Echo) -> (Established, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, remote) = listener.accept().await.unwrap();
        let chunk = handler.link().assign_receive_chunk().unwrap();
        let est = handler
            .link()
            .establish(ConnectionId::new(1), stream, remote, chunk);
        (est, peer)
    }

    async fn next_event(events: &EventQueue) -> Event {
        for _ in 0..500 {
            if let Some(event) = events.poll() {
                return event;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("no event");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_flow_both_ways() {
        let handler = handler(8, 16);
        let (est, mut peer) = established(&handler).await;
        let conn = Arc::clone(&est.conn);
        spawn_connection(Arc::clone(&handler), est);

        peer.write_all(&[0, 0, 0, 4, b'p', b'i', b'n', b'g']).await.unwrap();
        match next_event(handler.link().events()).await {
            Event::Data { id, payload } => {
                assert_eq!(id, ConnectionId::new(1));
                assert_eq!(payload.as_ref(), b"ping");
            }
            other => panic!("unexpected event {:?}", other),
        }

        // A payload spanning several chunks goes out in one frame
        let payload = vec![7u8; 40];
        send(handler.as_ref(), &conn, &payload).unwrap();
        let mut wire = vec![0u8; 44];
        peer.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 40]);
        assert_eq!(&wire[4..], payload.as_slice());

        drop(peer);
        assert_eq!(
            next_event(handler.link().events()).await,
            Event::Disconnected {
                id: ConnectionId::new(1)
            }
        );
        assert_eq!(*handler.closes.lock(), vec!["closed by peer".to_string()]);
    }

    #[tokio::test]
    async fn test_frame_rejections() {
        let handler = handler(2, 16);
        let (est, _peer) = established(&handler).await;
        let conn = est.conn;

        assert_eq!(handler.link().frame(&conn, b""), Err(SendError::EmptyPayload));
        assert_eq!(
            handler.link().frame(&conn, &[0u8; 1025]),
            Err(SendError::PayloadTooLarge { len: 1025, max: 1024 })
        );
        // Nothing was taken from the pool (one chunk is the receive buffer)
        assert_eq!(handler.link().pool().available(), 1);

        conn.mark_closed();
        assert_eq!(handler.link().frame(&conn, b"x"), Err(SendError::NotConnected));
    }

    #[tokio::test]
    async fn test_pool_exhaustion_closes_connection() {
        let handler = handler(2, 16);
        let (est, _peer) = established(&handler).await;
        let conn = est.conn;

        // One chunk left: a 13 byte payload does not fit with its header
        let result = send(handler.as_ref(), &conn, &[1u8; 13]);
        assert_eq!(
            result,
            Err(SendError::PoolExhausted {
                needed: 2,
                available: 1
            })
        );
        assert!(conn.is_closed());
        assert_eq!(*handler.closes.lock(), vec!["buffer pool exhausted".to_string()]);
        assert_eq!(handler.link().pool().available(), 1);
    }

    struct Faulty {
        inner: Arc<Echo>,
    }

    impl CompletionHandler for Faulty {
        fn link(&self) -> &Link {
            self.inner.link()
        }

        fn close(&self, conn: &Connection, reason: CloseReason) {
            self.inner.close(conn, reason);
        }

        fn on_receive(&self, _: &Connection, _: &mut Inbound, _: io::Result<usize>) -> Flow {
            panic!("receive handler failed");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_receive_panic_closes_connection() {
        let inner = handler(4, 16);
        let faulty = Arc::new(Faulty {
            inner: Arc::clone(&inner),
        });
        let (est, mut peer) = established(&inner).await;
        let conn = Arc::clone(&est.conn);
        spawn_connection(Arc::clone(&faulty), est);

        // The send loop is still idle when the receive task dies
        peer.write_all(&[0, 0, 0, 1, b'x']).await.unwrap();
        assert_eq!(
            next_event(inner.link().events()).await,
            Event::Disconnected {
                id: ConnectionId::new(1)
            }
        );
        assert!(conn.is_closed());
        assert_eq!(*inner.closes.lock(), vec!["connection task failed".to_string()]);

        let mut rest = Vec::new();
        assert_eq!(peer.read_to_end(&mut rest).await.unwrap_or(0), 0);

        for _ in 0..500 {
            if inner.link().pool().available() == 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(inner.link().pool().available(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_returns_every_chunk() {
        let handler = handler(4, 16);
        let (est, mut peer) = established(&handler).await;
        let conn = Arc::clone(&est.conn);
        spawn_connection(Arc::clone(&handler), est);

        send(handler.as_ref(), &conn, b"one").unwrap();
        send(handler.as_ref(), &conn, b"two").unwrap();
        handler.close(&conn, CloseReason::Local);

        let mut rest = Vec::new();
        let _ = peer.read_to_end(&mut rest).await;

        for _ in 0..500 {
            if handler.link().pool().available() == 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(handler.link().pool().available(), 4);
        assert_eq!(handler.link().dispatcher().in_flight(), 0);
    }
}
