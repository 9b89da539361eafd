//! Channel membership registry.
//!
//! Channels are created explicitly and live for the rest of the process,
//! even when empty. A connection is a member of at most one channel; `join`
//! moves it in a single call so no caller can observe it in two.

use crate::error::Rejected;
use crate::session::ConnectionId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Mapping from channel name to its member set.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, BTreeSet<ConnectionId>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty channel.
    ///
    /// Names are matched exactly: "Test Channel" and "Test Channel 23" are
    /// different channels. Leading whitespace is refused here; commands off
    /// the wire are already trimmed, so there only an empty name fails.
    pub fn create(&mut self, name: &str) -> Result<(), Rejected> {
        if name.is_empty() || name.starts_with(char::is_whitespace) {
            return Err(Rejected::InvalidChannelName);
        }
        if self.channels.contains_key(name) {
            return Err(Rejected::DuplicateChannel);
        }

        self.channels.insert(name.to_string(), BTreeSet::new());
        trace!(channel = name, "Channel created");
        Ok(())
    }

    /// Move `conn` from `previous` (if any) into `name`.
    ///
    /// Fails without side effects when `name` does not exist. Joining the
    /// channel you are already in is a no-op.
    pub fn join(
        &mut self,
        name: &str,
        previous: Option<&str>,
        conn: ConnectionId,
    ) -> Result<(), Rejected> {
        if !self.channels.contains_key(name) {
            return Err(Rejected::ChannelNotFound);
        }

        if let Some(previous) = previous {
            self.leave(previous, conn);
        }
        if let Some(members) = self.channels.get_mut(name) {
            members.insert(conn);
        }
        Ok(())
    }

    /// Drop one membership; returns whether it was present.
    pub fn leave(&mut self, name: &str, conn: ConnectionId) -> bool {
        self.channels
            .get_mut(name)
            .map(|members| members.remove(&conn))
            .unwrap_or(false)
    }

    /// Members ordered by connection id; empty when the channel is missing.
    pub fn members(&self, name: &str) -> Vec<ConnectionId> {
        self.channels
            .get(name)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// All channel names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
