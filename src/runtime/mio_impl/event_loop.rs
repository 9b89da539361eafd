//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! One `Poll` covers the listener, every connection and the UDP bridge.

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::FrameError;
use crate::runtime::bridge::UdpBridge;
use crate::runtime::connection::{Inbound, Outbox, Route, Routes};
use crate::runtime::{bind_bridge, create_listener, deliver, TcpSink};
use crate::session::{ConnectionId, Transport};
use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const BRIDGE_TOKEN: Token = Token(usize::MAX - 1);

/// Largest single read from a connection.
const READ_CHUNK: usize = 64 * 1024;

/// Per-connection state for the mio backend.
struct MioConnection {
    stream: TcpStream,
    id: ConnectionId,
    inbound: Inbound,
    outbox: Outbox,
    /// Whether WRITABLE interest is currently registered.
    writable: bool,
}

/// A bound mio server.
pub struct MioServer {
    poll: Poll,
    listener: TcpListener,
    bridge: Option<UdpBridge>,
    max_connections: usize,
    max_payload: usize,
    max_outbox: usize,
    batch_size: usize,
    upload_dir: PathBuf,
    dispatcher: Dispatcher,
}

impl MioServer {
    pub fn bind(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener = create_listener(config.listen, true)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mut bridge = bind_bridge(config)?;
        if let Some(bridge) = bridge.as_mut() {
            poll.registry()
                .register(bridge.socket_mut(), BRIDGE_TOKEN, Interest::READABLE)?;
        }

        Ok(Self {
            poll,
            listener,
            bridge,
            max_connections: config.max_connections,
            max_payload: config.max_message_size,
            max_outbox: config.max_outbox_bytes,
            batch_size: config.batch_size,
            upload_dir: config.upload_dir.clone(),
            dispatcher: Dispatcher::new(config.bare_text_chat),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        self.bridge.as_ref().and_then(|bridge| bridge.local_addr().ok())
    }

    pub fn run(self) -> io::Result<()> {
        let MioServer {
            mut poll,
            listener,
            bridge,
            max_connections,
            max_payload,
            max_outbox,
            batch_size,
            upload_dir,
            mut dispatcher,
        } = self;

        let mut bridge = bridge;
        let mut events = Events::with_capacity(batch_size);
        let mut connections: Slab<MioConnection> = Slab::with_capacity(max_connections.min(4096));
        let mut routes = Routes::new();
        let mut scratch = vec![0u8; READ_CHUNK];
        let limits = Limits {
            max_connections,
            max_payload,
            max_outbox,
        };

        info!(
            addr = %listener.local_addr()?,
            bridge = bridge.is_some(),
            "mio event loop started"
        );

        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                return Err(e);
            }
            let registry = poll.registry();

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => {
                        accept_connections(
                            &listener,
                            registry,
                            &mut connections,
                            &mut routes,
                            &mut dispatcher,
                            &limits,
                        );
                    }
                    BRIDGE_TOKEN => {
                        let Some(bridge) = bridge.as_mut() else {
                            continue;
                        };
                        let outbound = bridge.recv_all(&mut routes, &mut dispatcher);
                        let mut sink = MioSink::new(&mut connections, registry);
                        deliver(outbound, &routes, Some(&*bridge), &mut sink);
                        let failed = sink.failed;
                        close_failed(registry, &mut connections, &mut routes, &mut dispatcher, failed);
                    }
                    Token(key) => {
                        let mut failed = Vec::new();
                        if event.is_readable() || event.is_read_closed() {
                            if let Err(e) = handle_readable(
                                key,
                                registry,
                                &mut connections,
                                &routes,
                                &mut dispatcher,
                                bridge.as_ref(),
                                &mut scratch,
                                &upload_dir,
                                &mut failed,
                            ) {
                                log_connection_error(key, &e);
                                close_connection(
                                    registry,
                                    &mut connections,
                                    &mut routes,
                                    &mut dispatcher,
                                    key,
                                );
                            }
                        }
                        if event.is_writable() {
                            handle_writable(registry, &mut connections, &mut routes, &mut dispatcher, key);
                        }
                        close_failed(registry, &mut connections, &mut routes, &mut dispatcher, failed);
                    }
                }
            }
        }
    }
}

/// Per-connection sizing shared by every accepted stream.
struct Limits {
    max_connections: usize,
    max_payload: usize,
    max_outbox: usize,
}

/// Connections whose queueing failed, to be closed once delivery is done.
type Failed = Vec<(usize, ConnectionId, FrameError)>;

/// Queues frames into connection outboxes and writes them straight through.
struct MioSink<'a> {
    connections: &'a mut Slab<MioConnection>,
    registry: &'a Registry,
    failed: Failed,
}

impl<'a> MioSink<'a> {
    fn new(connections: &'a mut Slab<MioConnection>, registry: &'a Registry) -> Self {
        Self {
            connections,
            registry,
            failed: Vec::new(),
        }
    }
}

impl TcpSink for MioSink<'_> {
    fn queue(&mut self, key: usize, conn: ConnectionId, frame: Bytes) {
        let connection = match self.connections.get_mut(key) {
            Some(connection) if connection.id == conn => connection,
            _ => {
                debug!(conn_id = %conn, "Dropping frame for stale connection");
                return;
            }
        };
        if self.failed.iter().any(|(failed, ..)| *failed == key) {
            return;
        }

        let queued = connection
            .outbox
            .push(frame)
            .and_then(|()| flush_connection(self.registry, connection, key).map_err(FrameError::from));
        if let Err(e) = queued {
            self.failed.push((key, conn, e));
        }
    }
}

fn accept_connections(
    listener: &TcpListener,
    registry: &Registry,
    connections: &mut Slab<MioConnection>,
    routes: &mut Routes,
    dispatcher: &mut Dispatcher,
    limits: &Limits,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, peer_addr)) => {
                if connections.len() >= limits.max_connections {
                    warn!(peer = %peer_addr, "Connection limit reached");
                    continue;
                }

                let entry = connections.vacant_entry();
                let key = entry.key();
                if let Err(e) = registry.register(&mut stream, Token(key), Interest::READABLE) {
                    warn!(peer = %peer_addr, error = %e, "Failed to register connection");
                    continue;
                }
                let _ = stream.set_nodelay(true);

                let id = routes.open(Route::Tcp(key));
                entry.insert(MioConnection {
                    stream,
                    id,
                    inbound: Inbound::new(limits.max_payload),
                    outbox: Outbox::new(limits.max_outbox),
                    writable: false,
                });
                dispatcher.connect(id, Transport::Tcp);

                debug!(conn_id = %id, key, peer = %peer_addr, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
}

/// Read until the socket would block, dispatching as frames complete.
///
/// Other connections whose delivery failed are added to `failed`; a failure
/// on this connection is returned instead.
#[allow(clippy::too_many_arguments)]
fn handle_readable(
    key: usize,
    registry: &Registry,
    connections: &mut Slab<MioConnection>,
    routes: &Routes,
    dispatcher: &mut Dispatcher,
    bridge: Option<&UdpBridge>,
    scratch: &mut [u8],
    upload_dir: &Path,
    failed: &mut Failed,
) -> Result<(), FrameError> {
    loop {
        let Some(conn) = connections.get_mut(key) else {
            return Ok(());
        };

        let want = conn.inbound.wanted().min(scratch.len());
        let n = match conn.stream.read(&mut scratch[..want]) {
            Ok(0) => return Err(FrameError::Closed),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        let id = conn.id;
        let outbound = conn
            .inbound
            .ingest(&scratch[..n], id, dispatcher, upload_dir)?;

        let mut sink = MioSink::new(connections, registry);
        deliver(outbound, routes, bridge, &mut sink);
        let mut delivered = sink.failed;
        if let Some(pos) = delivered.iter().position(|(failed, ..)| *failed == key) {
            let (_, _, e) = delivered.swap_remove(pos);
            failed.append(&mut delivered);
            return Err(e);
        }
        failed.append(&mut delivered);
    }
}

/// Resume writing once the socket drains.
fn handle_writable(
    registry: &Registry,
    connections: &mut Slab<MioConnection>,
    routes: &mut Routes,
    dispatcher: &mut Dispatcher,
    key: usize,
) {
    let Some(conn) = connections.get_mut(key) else {
        return;
    };
    if let Err(e) = flush_connection(registry, conn, key) {
        debug!(conn_id = %conn.id, error = %e, "Write failed");
        close_connection(registry, connections, routes, dispatcher, key);
    }
}

/// Write as much of the outbox as the socket accepts.
fn flush_connection(registry: &Registry, conn: &mut MioConnection, key: usize) -> io::Result<()> {
    while let Some(chunk) = conn.outbox.front_remaining() {
        match conn.stream.write(&chunk) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => conn.outbox.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    // Keep WRITABLE interest only while output is pending.
    let pending = !conn.outbox.is_empty();
    if pending != conn.writable {
        let interest = if pending {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        registry.reregister(&mut conn.stream, Token(key), interest)?;
        conn.writable = pending;
    }
    Ok(())
}

fn log_connection_error(key: usize, e: &FrameError) {
    if e.is_protocol_violation() {
        warn!(key, error = %e, "Protocol violation, closing connection");
    } else if matches!(e, FrameError::Backlog { .. }) {
        warn!(key, error = %e, "Peer is not reading, closing connection");
    } else {
        debug!(key, error = %e, "Connection error");
    }
}

/// Close every connection that could not take its frames.
fn close_failed(
    registry: &Registry,
    connections: &mut Slab<MioConnection>,
    routes: &mut Routes,
    dispatcher: &mut Dispatcher,
    failed: Failed,
) {
    for (key, id, e) in failed {
        if connections.get(key).is_some_and(|conn| conn.id == id) {
            log_connection_error(key, &e);
            close_connection(registry, connections, routes, dispatcher, key);
        }
    }
}

fn close_connection(
    registry: &Registry,
    connections: &mut Slab<MioConnection>,
    routes: &mut Routes,
    dispatcher: &mut Dispatcher,
    key: usize,
) {
    if let Some(mut conn) = connections.try_remove(key) {
        let _ = registry.deregister(&mut conn.stream);
        routes.remove(conn.id);
        dispatcher.disconnect(conn.id);
        debug!(conn_id = %conn.id, "Connection closed");
    }
}
