//! Operation tracking for io_uring completion correlation.
//!
//! Each submitted operation owns its context (buffers included) inside a
//! slab; the slab key is the `user_data` token. A context leaves the table
//! exactly once, through `take`, when its completion is harvested.

use crate::session::ConnectionId;
use bytes::Bytes;
use slab::Slab;

/// Generational handle to a connection slot.
///
/// The slab key alone can be reused after a connection closes; the
/// `ConnectionId` never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnRef {
    pub key: usize,
    pub id: ConnectionId,
}

/// Context of one in-flight operation.
#[derive(Debug)]
pub enum Op {
    /// Accept on the listener.
    Accept,
    /// Receive into `buf`, sized for the connection's current phase.
    Recv { conn: ConnRef, buf: Vec<u8> },
    /// Send the bytes of `frame`, kept alive until completion.
    Send { conn: ConnRef, frame: Bytes },
    /// Readiness poll on the bridge socket.
    BridgePoll,
}

/// Slab of in-flight operation contexts.
pub struct OpTable {
    ops: Slab<Op>,
}

impl OpTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Store a context and return its token.
    pub fn insert(&mut self, op: Op) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Remove and return the context for a token.
    ///
    /// Returns None if the token is unknown or was already taken.
    pub fn take(&mut self, token: u64) -> Option<Op> {
        self.ops.try_remove(token as usize)
    }

    /// Number of operations in flight.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
