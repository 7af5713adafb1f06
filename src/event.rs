//! Transport events handed to the embedding application.
//!
//! Worker threads push events as completions arrive; the application drains
//! them on its own schedule with [`EventQueue::poll`]. Handlers never call
//! back into application code.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Identifier of a connection.
///
/// Server connections get positive, strictly increasing ids. The client's
/// single connection is always [`ConnectionId::CLIENT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Identity used by the client for its one connection.
    pub const CLIENT: ConnectionId = ConnectionId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<ConnectionId> for u32 {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

/// Something that happened on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected { id: ConnectionId },
    Data { id: ConnectionId, payload: Bytes },
    Disconnected { id: ConnectionId },
}

impl Event {
    pub fn id(&self) -> ConnectionId {
        match self {
            Event::Connected { id } | Event::Data { id, .. } | Event::Disconnected { id } => *id,
        }
    }
}

/// Thread-safe FIFO of events, in completion-arrival order.
pub struct EventQueue {
    tx: UnboundedSender<Event>,
    rx: Mutex<UnboundedReceiver<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue an event. Never blocks.
    pub fn push(&self, event: Event) {
        // The receiver lives as long as the queue, so this cannot fail.
        let _ = self.tx.send(event);
    }

    /// Dequeue the oldest event, if any. Never blocks.
    pub fn poll(&self) -> Option<Event> {
        match self.rx.lock().try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.rx.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue").field("len", &self.len()).finish()
    }
}
