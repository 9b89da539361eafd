//! io_uring event loop for Linux.
//!
//! Completion-based model: submit operations to the ring,
//! then process completions in batches.
//!
//! Receives are sized by the connection's inbound phase (header, payload or
//! upload chunk), so each completion feeds exactly what the decoder asked
//! for. Each connection has at most one send in flight; partial sends are
//! resubmitted from the outbox head.
//!
//! Accept and the bridge poll are standing operations. When the ring
//! refuses one it is retried on the next loop turn, and the loop stops
//! blocking on the ring until both are armed again.

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::FrameError;
use crate::runtime::bridge::UdpBridge;
use crate::runtime::connection::{Inbound, Outbox, Route, Routes};
use crate::runtime::token::{ConnRef, Op, OpTable};
use crate::runtime::{bind_bridge, create_listener, deliver, TcpSink};
use crate::session::{ConnectionId, Transport};
use bytes::Bytes;
use io_uring::{opcode, squeue, types, IoUring};
use slab::Slab;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Largest single receive.
const READ_CHUNK: usize = 64 * 1024;

/// Pause between turns while a standing operation is not armed.
const REARM_BACKOFF: Duration = Duration::from_millis(10);

/// Per-connection state for the io_uring backend.
struct UringConnection {
    stream: TcpStream,
    id: ConnectionId,
    inbound: Inbound,
    outbox: Outbox,
    /// Operations submitted and not yet harvested.
    in_flight: usize,
    sending: bool,
    closing: bool,
}

/// A bound io_uring server.
pub struct UringServer {
    ring: IoUring,
    listener: TcpListener,
    bridge: Option<UdpBridge>,
    max_connections: usize,
    max_payload: usize,
    max_outbox: usize,
    batch_size: usize,
    upload_dir: PathBuf,
    dispatcher: Dispatcher,
}

impl UringServer {
    pub fn bind(config: &Config) -> io::Result<Self> {
        let ring = IoUring::new(config.ring_size)?;
        // Blocking: the ring does the waiting for accept.
        let listener = create_listener(config.listen, false)?;
        let bridge = bind_bridge(config)?;

        Ok(Self {
            ring,
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
        Worker::new(self).run()
    }
}

/// Loop state owned by the thread running the ring.
struct Worker {
    ring: IoUring,
    ops: OpTable,
    connections: Slab<UringConnection>,
    routes: Routes,
    listener: TcpListener,
    bridge: Option<UdpBridge>,
    dispatcher: Dispatcher,
    upload_dir: PathBuf,
    max_connections: usize,
    max_payload: usize,
    max_outbox: usize,
    batch_size: usize,
    /// An accept is queued on the ring.
    accept_armed: bool,
    /// A bridge poll is queued on the ring.
    bridge_armed: bool,
}

impl Worker {
    fn new(server: UringServer) -> Self {
        let capacity = server.max_connections.min(4096);
        Self {
            ring: server.ring,
            ops: OpTable::new(capacity * 2),
            connections: Slab::with_capacity(capacity),
            routes: Routes::new(),
            listener: server.listener,
            bridge: server.bridge,
            dispatcher: server.dispatcher,
            upload_dir: server.upload_dir,
            max_connections: server.max_connections,
            max_payload: server.max_payload,
            max_outbox: server.max_outbox,
            batch_size: server.batch_size,
            accept_armed: false,
            bridge_armed: false,
        }
    }

    fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.listener.local_addr()?,
            bridge = self.bridge.is_some(),
            "io_uring event loop started"
        );

        loop {
            self.rearm();
            let armed = self.is_armed();

            // Submit pending operations and wait for at least one completion
            match self.ring.submit_and_wait(usize::from(armed)) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Ring submission failed");
                    return Err(e);
                }
            }

            let completions: Vec<(u64, i32)> = self
                .ring
                .completion()
                .take(self.batch_size)
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect();

            if completions.is_empty() && !armed {
                thread::sleep(REARM_BACKOFF);
            }

            for (token, result) in completions {
                let op = match self.ops.take(token) {
                    Some(op) => op,
                    None => {
                        warn!(token, "Unknown token in completion");
                        continue;
                    }
                };

                match op {
                    Op::Accept => self.handle_accept(result),
                    Op::Recv { conn, buf } => self.handle_recv(result, conn, buf),
                    Op::Send { conn, frame } => self.handle_send(result, conn, frame),
                    Op::BridgePoll => self.handle_bridge(result),
                }
            }
        }
    }

    /// True when every standing operation is queued on the ring.
    fn is_armed(&self) -> bool {
        self.accept_armed && (self.bridge.is_none() || self.bridge_armed)
    }

    /// Queue whichever standing operations are missing.
    fn rearm(&mut self) {
        if !self.accept_armed {
            self.accept_armed = self.submit_accept();
        }
        if self.bridge.is_some() && !self.bridge_armed {
            self.bridge_armed = self.submit_bridge_poll();
        }
    }
}

/// Queues frames into outboxes and remembers who needs a send.
struct UringSink<'a> {
    connections: &'a mut Slab<UringConnection>,
    touched: Vec<usize>,
    /// Connections whose outbox refused a frame.
    overflowed: Vec<(usize, FrameError)>,
}

impl<'a> UringSink<'a> {
    fn new(connections: &'a mut Slab<UringConnection>) -> Self {
        Self {
            connections,
            touched: Vec::new(),
            overflowed: Vec::new(),
        }
    }
}

impl TcpSink for UringSink<'_> {
    fn queue(&mut self, key: usize, conn: ConnectionId, frame: Bytes) {
        match self.connections.get_mut(key) {
            Some(connection) if connection.id == conn && !connection.closing => {
                if self.overflowed.iter().any(|(overflowed, _)| *overflowed == key) {
                    return;
                }
                match connection.outbox.push(frame) {
                    Ok(()) => self.touched.push(key),
                    Err(e) => self.overflowed.push((key, e)),
                }
            }
            _ => debug!(conn_id = %conn, "Dropping frame for stale connection"),
        }
    }
}

impl Worker {
    fn handle_accept(&mut self, result: i32) {
        // Re-armed at the top of the next turn
        self.accept_armed = false;

        if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            match -result {
                libc::EINTR | libc::EAGAIN | libc::ECONNABORTED => {
                    debug!(error = %err, "Accept interrupted")
                }
                _ => warn!(error = %err, "Accept failed"),
            }
            return;
        }

        // SAFETY: a successful accept completion hands us a new, unowned fd.
        let stream = unsafe { TcpStream::from_raw_fd(result) };

        if self.connections.len() >= self.max_connections {
            warn!("Connection limit reached, closing");
            return;
        }
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();

        let entry = self.connections.vacant_entry();
        let key = entry.key();
        let id = self.routes.open(Route::Tcp(key));
        entry.insert(UringConnection {
            stream,
            id,
            inbound: Inbound::new(self.max_payload),
            outbox: Outbox::new(self.max_outbox),
            in_flight: 0,
            sending: false,
            closing: false,
        });
        self.dispatcher.connect(id, Transport::Tcp);

        debug!(conn_id = %id, key, peer = ?peer, "Accepted connection");

        self.submit_recv(key);
    }

    fn handle_recv(&mut self, result: i32, conn: ConnRef, buf: Vec<u8>) {
        let Some(connection) = live_slot(&mut self.connections, conn) else {
            return;
        };
        connection.in_flight -= 1;
        if connection.closing {
            self.release_if_idle(conn.key);
            return;
        }

        if result < 0 {
            if is_transient(result) {
                self.submit_recv(conn.key);
            } else {
                let err = FrameError::Io(io::Error::from_raw_os_error(-result));
                self.close_connection(conn.key, &err);
            }
            return;
        }
        if result == 0 {
            self.close_connection(conn.key, &FrameError::Closed);
            return;
        }

        let n = result as usize;
        let ingested = connection.inbound.ingest(
            &buf[..n],
            conn.id,
            &mut self.dispatcher,
            &self.upload_dir,
        );
        match ingested {
            Ok(outbound) => {
                self.submit_recv(conn.key);

                let mut sink = UringSink::new(&mut self.connections);
                deliver(outbound, &self.routes, self.bridge.as_ref(), &mut sink);
                let (touched, overflowed) = (sink.touched, sink.overflowed);
                self.finish_delivery(touched, overflowed);
            }
            Err(e) => self.close_connection(conn.key, &e),
        }
    }

    fn handle_send(&mut self, result: i32, conn: ConnRef, frame: Bytes) {
        let Some(connection) = live_slot(&mut self.connections, conn) else {
            return;
        };
        connection.in_flight -= 1;
        connection.sending = false;
        if connection.closing {
            self.release_if_idle(conn.key);
            return;
        }

        match result {
            r if r < 0 && is_transient(r) => {}
            r if r <= 0 => {
                let err = if r == 0 {
                    io::Error::new(io::ErrorKind::WriteZero, "send returned 0")
                } else {
                    io::Error::from_raw_os_error(-r)
                };
                self.close_connection(conn.key, &FrameError::Io(err));
                return;
            }
            n => {
                let n = (n as usize).min(frame.len());
                connection.outbox.advance(n);
            }
        }

        self.submit_send(conn.key);
    }

    fn handle_bridge(&mut self, result: i32) {
        self.bridge_armed = false;
        if result < 0 && !is_transient(result) {
            warn!(error = %io::Error::from_raw_os_error(-result), "Bridge poll failed");
        }

        if let Some(bridge) = self.bridge.as_mut() {
            let outbound = bridge.recv_all(&mut self.routes, &mut self.dispatcher);
            let mut sink = UringSink::new(&mut self.connections);
            deliver(outbound, &self.routes, Some(&*bridge), &mut sink);
            let (touched, overflowed) = (sink.touched, sink.overflowed);
            self.finish_delivery(touched, overflowed);
        }
    }

    /// Start sends for connections that gained output and drop the ones
    /// that fell too far behind.
    fn finish_delivery(&mut self, mut touched: Vec<usize>, overflowed: Vec<(usize, FrameError)>) {
        for (key, e) in overflowed {
            self.close_connection(key, &e);
        }
        touched.sort_unstable();
        touched.dedup();
        for key in touched {
            self.submit_send(key);
        }
    }

    /// Queue an accept; false if the ring refused it.
    fn submit_accept(&mut self) -> bool {
        let token = self.ops.insert(Op::Accept);

        let accept = opcode::Accept::new(
            types::Fd(self.listener.as_raw_fd()),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .build()
        .user_data(token);

        match push_entry(&mut self.ring, &accept) {
            Ok(()) => true,
            Err(e) => {
                self.ops.take(token);
                warn!(error = %e, "Failed to arm accept, retrying");
                false
            }
        }
    }

    /// Queue a readiness poll on the bridge socket; false if refused.
    fn submit_bridge_poll(&mut self) -> bool {
        let Some(bridge) = self.bridge.as_ref() else {
            return false;
        };
        let fd = bridge.as_raw_fd();
        let token = self.ops.insert(Op::BridgePoll);

        let poll = opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32)
            .build()
            .user_data(token);

        match push_entry(&mut self.ring, &poll) {
            Ok(()) => true,
            Err(e) => {
                self.ops.take(token);
                warn!(error = %e, "Failed to arm bridge poll, retrying");
                false
            }
        }
    }

    /// Submit a receive sized for the connection's current phase.
    fn submit_recv(&mut self, key: usize) {
        let Some(connection) = self.connections.get_mut(key) else {
            return;
        };
        if connection.closing {
            return;
        }

        let len = connection.inbound.wanted().clamp(1, READ_CHUNK);
        let mut buf = vec![0u8; len];
        let ptr = buf.as_mut_ptr();
        let fd = connection.stream.as_raw_fd();
        let conn = ConnRef {
            key,
            id: connection.id,
        };

        // The heap buffer does not move when the Vec moves into the table.
        let token = self.ops.insert(Op::Recv { conn, buf });
        let recv = opcode::Recv::new(types::Fd(fd), ptr, len as u32)
            .build()
            .user_data(token);

        match push_entry(&mut self.ring, &recv) {
            Ok(()) => connection.in_flight += 1,
            Err(e) => {
                self.ops.take(token);
                warn!(conn_id = %conn.id, error = %e, "Dropping receive");
                self.close_connection(key, &FrameError::Io(e));
            }
        }
    }

    /// Submit the outbox head unless a send is already in flight.
    fn submit_send(&mut self, key: usize) {
        let Some(connection) = self.connections.get_mut(key) else {
            return;
        };
        if connection.closing || connection.sending {
            return;
        }
        let Some(chunk) = connection.outbox.front_remaining() else {
            return;
        };

        let ptr = chunk.as_ptr();
        let len = chunk.len();
        let fd = connection.stream.as_raw_fd();
        let conn = ConnRef {
            key,
            id: connection.id,
        };

        let token = self.ops.insert(Op::Send { conn, frame: chunk });
        let send = opcode::Send::new(types::Fd(fd), ptr, len as u32)
            .build()
            .user_data(token);

        match push_entry(&mut self.ring, &send) {
            Ok(()) => {
                connection.in_flight += 1;
                connection.sending = true;
            }
            Err(e) => {
                self.ops.take(token);
                warn!(conn_id = %conn.id, error = %e, "Dropping send");
                self.close_connection(key, &FrameError::Io(e));
            }
        }
    }

    /// Tear a connection down; the slot is freed once nothing is in flight.
    fn close_connection(&mut self, key: usize, reason: &FrameError) {
        let Some(connection) = self.connections.get_mut(key) else {
            return;
        };
        if connection.closing {
            return;
        }
        connection.closing = true;

        if reason.is_protocol_violation() {
            warn!(conn_id = %connection.id, error = %reason, "Protocol violation, closing connection");
        } else if matches!(reason, FrameError::Backlog { .. }) {
            warn!(conn_id = %connection.id, error = %reason, "Peer is not reading, closing connection");
        } else {
            debug!(conn_id = %connection.id, error = %reason, "Connection error");
        }

        // Wakes any receive still parked on this socket.
        let _ = connection.stream.shutdown(Shutdown::Both);
        let id = connection.id;
        self.routes.remove(id);
        self.dispatcher.disconnect(id);

        self.release_if_idle(key);
    }

    fn release_if_idle(&mut self, key: usize) {
        let idle = self
            .connections
            .get(key)
            .is_some_and(|connection| connection.closing && connection.in_flight == 0);
        if idle {
            if let Some(connection) = self.connections.try_remove(key) {
                debug!(conn_id = %connection.id, "Connection closed");
            }
        }
    }
}

/// Push one entry, flushing the submission queue once if it is full.
fn push_entry(ring: &mut IoUring, entry: &squeue::Entry) -> io::Result<()> {
    // SAFETY: every buffer an entry points at is owned by its `Op` in the
    // table and outlives the operation.
    if unsafe { ring.submission().push(entry) }.is_ok() {
        return Ok(());
    }

    ring.submit()?;
    unsafe { ring.submission().push(entry) }
        .map_err(|_| io::Error::other("submission queue full"))
}

/// Slot for `conn`, if it still belongs to that connection.
fn live_slot(
    connections: &mut Slab<UringConnection>,
    conn: ConnRef,
) -> Option<&mut UringConnection> {
    match connections.get_mut(conn.key) {
        Some(connection) if connection.id == conn.id => Some(connection),
        _ => {
            warn!(conn_id = %conn.id, key = conn.key, "Completion for a released slot");
            None
        }
    }
}

fn is_transient(result: i32) -> bool {
    matches!(-result, libc::EINTR | libc::EAGAIN)
}
