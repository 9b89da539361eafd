//! Command dispatch.
//!
//! The dispatcher owns the session table and the channel registry. Each
//! inbound payload is parsed into a `Command`, applied, and turned into a
//! list of `Outbound` deliveries for the runtime to carry out. Nothing in
//! here touches a socket.

use crate::channel::ChannelRegistry;
use crate::error::Rejected;
use crate::protocol::{Command, Parser, Response};
use crate::session::{ConnectionId, SessionTable, Transport};
use tracing::debug;

/// A delivery produced by a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One payload to one connection, whatever its transport.
    Send { to: ConnectionId, text: String },

    /// One datagram to the bridge's multicast group.
    Multicast { text: String },

    /// Switch `conn` into the upload drain.
    Upload {
        conn: ConnectionId,
        filename: String,
        size: Option<u64>,
    },
}

/// Applies commands to the shared chat state.
#[derive(Debug)]
pub struct Dispatcher {
    sessions: SessionTable,
    channels: ChannelRegistry,
    bare_text_chat: bool,
}

impl Dispatcher {
    pub fn new(bare_text_chat: bool) -> Self {
        Self {
            sessions: SessionTable::new(),
            channels: ChannelRegistry::new(),
            bare_text_chat,
        }
    }

    /// Open a session for a new connection.
    pub fn connect(&mut self, conn: ConnectionId, transport: Transport) {
        self.sessions.open(conn, transport);
        debug!(conn_id = %conn, ?transport, "Session opened");
    }

    /// Drop a connection's session, name and channel membership.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        if let Some(session) = self.sessions.forget(conn) {
            if let Some(channel) = &session.channel {
                self.channels.leave(channel, conn);
            }
            debug!(conn_id = %conn, name = ?session.name, "Session closed");
        }
    }

    /// Apply one payload from `conn`.
    pub fn dispatch(&mut self, conn: ConnectionId, payload: &[u8]) -> Vec<Outbound> {
        let text = String::from_utf8_lossy(payload);
        let command = Parser::parse(&text, self.bare_text_chat);

        match self.apply(conn, command) {
            Ok(outbound) => outbound,
            Err(rejected) => {
                debug!(conn_id = %conn, reason = %rejected, "Command rejected");
                vec![Outbound::Send {
                    to: conn,
                    text: rejected.to_string(),
                }]
            }
        }
    }

    fn apply(&mut self, conn: ConnectionId, command: Command) -> Result<Vec<Outbound>, Rejected> {
        let reply = |text: String| vec![Outbound::Send { to: conn, text }];

        match command {
            Command::Name(name) => {
                let name = self.sessions.assign_name(conn, &name)?;
                Ok(reply(Response::welcome(&name)))
            }
            Command::Create(channel) => {
                self.channels.create(&channel)?;
                self.enter(conn, &channel)?;
                Ok(reply(Response::channel_created().to_string()))
            }
            Command::Join(channel) => {
                self.enter(conn, &channel)?;
                Ok(reply(Response::joined_channel().to_string()))
            }
            Command::List => {
                let names = self.channels.list();
                Ok(reply(Response::channel_list(names.iter().map(String::as_str))))
            }
            Command::Users => {
                let channel = self.sessions.channel(conn).unwrap_or_default().to_string();
                let names: Vec<String> = self
                    .channels
                    .members(&channel)
                    .into_iter()
                    .map(|member| self.sessions.display_name(member))
                    .collect();
                Ok(reply(Response::user_list(&channel, &names)))
            }
            Command::DirectMessage { to, text } => {
                let target = self.sessions.lookup(&to).ok_or(Rejected::UserNotFound)?;
                let sender = self.sessions.display_name(conn);
                Ok(vec![Outbound::Send {
                    to: target,
                    text: Response::direct_message(&sender, &text),
                }])
            }
            Command::Message(text) => self.broadcast(conn, &text),
            Command::Help => Ok(reply(Response::help().to_string())),
            Command::SendFile { filename, size } => {
                if self.sessions.transport(conn) == Transport::Udp {
                    return Err(Rejected::UploadUnsupported);
                }
                let filename = sanitize_filename(&filename).ok_or(Rejected::InvalidFileName)?;
                Ok(vec![Outbound::Upload {
                    conn,
                    filename,
                    size,
                }])
            }
            Command::Connect => Ok(reply(Response::connected().to_string())),
            Command::Invalid => Err(Rejected::InvalidCommand),
        }
    }

    /// Join `channel`, vacating whatever channel `conn` was in.
    fn enter(&mut self, conn: ConnectionId, channel: &str) -> Result<(), Rejected> {
        let previous = self.sessions.channel(conn).map(str::to_string);
        self.channels.join(channel, previous.as_deref(), conn)?;
        self.sessions.set_channel(conn, channel);
        debug!(conn_id = %conn, channel, "Joined channel");
        Ok(())
    }

    fn broadcast(&self, conn: ConnectionId, text: &str) -> Result<Vec<Outbound>, Rejected> {
        let channel = self.sessions.channel(conn).ok_or(Rejected::NotInChannel)?;
        let sender = self.sessions.display_name(conn);
        let line = Response::channel_message(channel, &sender, text);

        let mut outbound = Vec::new();
        let mut bridged = false;
        for member in self.channels.members(channel) {
            if member == conn {
                continue;
            }
            match self.sessions.transport(member) {
                Transport::Tcp => outbound.push(Outbound::Send {
                    to: member,
                    text: line.clone(),
                }),
                Transport::Udp => bridged = true,
            }
        }
        // Bridged members share one group datagram.
        if bridged {
            outbound.push(Outbound::Multicast { text: line });
        }
        Ok(outbound)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }
}

/// Reduce a client-supplied path to its final component.
fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    match base {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}
