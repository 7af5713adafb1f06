//! Operation token tracking for completion correlation.
//!
//! Each issued operation gets a unique token that identifies the operation
//! type and its connection when the completion arrives.

use crate::event::ConnectionId;
use slab::Slab;

/// Type of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Accept operation on the listener socket.
    Accept,
    /// Outbound connect of the client.
    Connect,
    /// Receive operation on a connection.
    Receive {
        /// Connection identifier in the registry.
        conn_id: ConnectionId,
    },
    /// Send operation on a connection. The pool lease travels with the
    /// completion.
    Send {
        /// Connection identifier in the registry.
        conn_id: ConnectionId,
    },
}

/// Handle of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpToken(usize);

/// Allocator for operation tokens with O(1) lookup.
///
/// Uses a slab to efficiently allocate and deallocate tokens,
/// providing stable identifiers for in-flight operations.
pub struct TokenAllocator {
    ops: Slab<OpType>,
}

impl TokenAllocator {
    /// Create a new token allocator with specified capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Allocate a new token for an operation.
    pub fn alloc(&mut self, op: OpType) -> OpToken {
        OpToken(self.ops.insert(op))
    }

    /// Get the operation type for a token.
    ///
    /// Returns None if the token is invalid or already freed.
    #[cfg(test)]
    pub fn get(&self, token: OpToken) -> Option<OpType> {
        self.ops.get(token.0).copied()
    }

    /// Free a token, making it available for reuse.
    ///
    /// Returns the operation type that was associated with the token.
    pub fn free(&mut self, token: OpToken) -> Option<OpType> {
        self.ops.try_remove(token.0)
    }

    /// Drop every token.
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Number of currently allocated tokens.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if there are no allocated tokens.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
