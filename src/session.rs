//! Per-connection session state.
//!
//! Tracks, for every live connection:
//! - its display name, unique process-wide once assigned
//! - the channel it currently belongs to, if any
//! - the transport it arrived on (stream or bridged datagram)

use crate::error::Rejected;
use std::collections::HashMap;
use std::fmt;

/// Opaque connection identifier, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a session's connection reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Accepted TCP stream.
    #[default]
    Tcp,
    /// Peer bridged over UDP after a `/connect` handshake.
    Udp,
}

/// Identity and channel pointer for one connection.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub name: Option<String>,
    pub channel: Option<String>,
    pub transport: Transport,
}

/// Mapping from connection to session, plus the name uniqueness index.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<ConnectionId, Session>,
    names: HashMap<String, ConnectionId>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh session with no name and no channel.
    pub fn open(&mut self, conn: ConnectionId, transport: Transport) {
        self.sessions.insert(
            conn,
            Session {
                transport,
                ..Session::default()
            },
        );
    }

    /// Assign a display name.
    ///
    /// The name is trimmed. Empty names and names held by another connection
    /// are rejected without touching any state. On success the previous
    /// name, if any, is released.
    pub fn assign_name(&mut self, conn: ConnectionId, raw_name: &str) -> Result<String, Rejected> {
        let name = raw_name.trim();
        if name.is_empty() {
            return Err(Rejected::EmptyName);
        }
        if let Some(owner) = self.names.get(name) {
            if *owner != conn {
                return Err(Rejected::DuplicateName);
            }
        }

        let session = self.sessions.entry(conn).or_default();
        if let Some(previous) = session.name.replace(name.to_string()) {
            self.names.remove(&previous);
        }
        self.names.insert(name.to_string(), conn);

        Ok(name.to_string())
    }

    /// Overwrite the connection's current channel.
    pub fn set_channel(&mut self, conn: ConnectionId, channel: &str) {
        self.sessions.entry(conn).or_default().channel = Some(channel.to_string());
    }

    pub fn channel(&self, conn: ConnectionId) -> Option<&str> {
        self.sessions.get(&conn)?.channel.as_deref()
    }

    pub fn transport(&self, conn: ConnectionId) -> Transport {
        self.sessions
            .get(&conn)
            .map(|session| session.transport)
            .unwrap_or_default()
    }

    /// Assigned name, or `user_<id>` when none has been assigned.
    pub fn display_name(&self, conn: ConnectionId) -> String {
        self.sessions
            .get(&conn)
            .and_then(|session| session.name.clone())
            .unwrap_or_else(|| format!("user_{conn}"))
    }

    /// Connection currently holding `name`.
    pub fn lookup(&self, name: &str) -> Option<ConnectionId> {
        self.names.get(name).copied()
    }

    /// Remove all state for a connection, releasing its name.
    pub fn forget(&mut self, conn: ConnectionId) -> Option<Session> {
        let session = self.sessions.remove(&conn)?;
        if let Some(name) = &session.name {
            self.names.remove(name);
        }
        Some(session)
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.sessions.contains_key(&conn)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
