//! Per-connection state shared by both event loops.
//!
//! - `Inbound`: frame decoding, or the upload drain after `/sendfile`
//! - `Outbox`: FIFO of encoded frames with a partial-write offset
//! - `Routes`: `ConnectionId` to transport address, in both directions

use crate::dispatcher::{Dispatcher, Outbound};
use crate::error::FrameError;
use crate::protocol::{FrameDecoder, Response};
use crate::session::ConnectionId;
use crate::upload::Upload;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use tracing::warn;

/// Inbound half of a stream connection.
#[derive(Debug)]
pub struct Inbound {
    decoder: FrameDecoder,
    upload: Option<Upload>,
}

impl Inbound {
    pub fn new(max_payload: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(max_payload),
            upload: None,
        }
    }

    /// Bytes to request from the socket next.
    pub fn wanted(&self) -> usize {
        match &self.upload {
            Some(upload) => upload.wanted(),
            None => self.decoder.wanted(),
        }
    }

    pub fn is_uploading(&self) -> bool {
        self.upload.is_some()
    }

    /// Consume one read segment, dispatching every completed frame.
    ///
    /// Upload requests from the dispatcher are handled here and never
    /// returned; their outcome is reported to `conn` as a reply.
    pub fn ingest(
        &mut self,
        mut data: &[u8],
        conn: ConnectionId,
        dispatcher: &mut Dispatcher,
        upload_dir: &Path,
    ) -> Result<Vec<Outbound>, FrameError> {
        let mut out = Vec::new();

        while !data.is_empty() {
            if let Some(upload) = &mut self.upload {
                let used = upload.feed(data)?;
                data = &data[used..];
                if upload.is_done() {
                    self.upload = None;
                    out.push(reply(conn, Response::upload_done()));
                }
                continue;
            }

            let (used, frame) = self.decoder.feed(data)?;
            data = &data[used..];
            let Some(payload) = frame else {
                continue;
            };

            for outbound in dispatcher.dispatch(conn, &payload) {
                match outbound {
                    Outbound::Upload { filename, size, .. } => {
                        self.begin_upload(conn, upload_dir, &filename, size, &mut out);
                    }
                    other => out.push(other),
                }
            }
        }

        Ok(out)
    }

    fn begin_upload(
        &mut self,
        conn: ConnectionId,
        dir: &Path,
        filename: &str,
        size: Option<u64>,
        out: &mut Vec<Outbound>,
    ) {
        match Upload::start(dir, filename, size) {
            Ok(upload) if upload.is_done() => out.push(reply(conn, Response::upload_done())),
            Ok(upload) => self.upload = Some(upload),
            Err(e) => {
                warn!(conn_id = %conn, filename, error = %e, "Failed to open upload file");
                out.push(reply(conn, Response::upload_failed()));
            }
        }
    }
}

fn reply(to: ConnectionId, text: &str) -> Outbound {
    Outbound::Send {
        to,
        text: text.to_string(),
    }
}

/// Outbound queue for one stream connection.
///
/// Holds at most `limit` unsent bytes. The frame at the head is always
/// accepted, so a single frame larger than the limit still goes out.
#[derive(Debug)]
pub struct Outbox {
    frames: VecDeque<Bytes>,
    offset: usize,
    queued: usize,
    limit: usize,
}

impl Outbox {
    pub fn new(limit: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            offset: 0,
            queued: 0,
            limit,
        }
    }

    /// Queue a frame, or refuse it when the peer is too far behind.
    pub fn push(&mut self, frame: Bytes) -> Result<(), FrameError> {
        if !self.frames.is_empty() && self.queued + frame.len() > self.limit {
            return Err(FrameError::Backlog {
                queued: self.queued,
                limit: self.limit,
            });
        }
        self.queued += frame.len();
        self.frames.push_back(frame);
        Ok(())
    }

    /// Unsent remainder of the frame at the head of the queue.
    pub fn front_remaining(&self) -> Option<Bytes> {
        self.frames.front().map(|frame| frame.slice(self.offset..))
    }

    /// Record `n` bytes of the head frame as written.
    pub fn advance(&mut self, n: usize) {
        let Some(front) = self.frames.front() else {
            return;
        };
        let n = n.min(front.len() - self.offset);
        self.offset += n;
        self.queued -= n;
        if self.offset == front.len() {
            self.frames.pop_front();
            self.offset = 0;
        }
    }

    /// Unsent bytes across every queued frame.
    pub fn queued(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Where a connection's frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Stream connection at this slab key.
    Tcp(usize),
    /// Bridged peer at this datagram address.
    Udp(SocketAddr),
}

/// Id allocation and routing for every live connection.
#[derive(Debug)]
pub struct Routes {
    by_id: HashMap<ConnectionId, Route>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    next_id: u64,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_addr: HashMap::new(),
            next_id: 1,
        }
    }
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id bound to `route`.
    pub fn open(&mut self, route: Route) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        self.by_id.insert(id, route);
        if let Route::Udp(addr) = route {
            self.by_addr.insert(addr, id);
        }
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<Route> {
        self.by_id.get(&id).copied()
    }

    /// Bridged peer already holding an id.
    pub fn peer(&self, addr: &SocketAddr) -> Option<ConnectionId> {
        self.by_addr.get(addr).copied()
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Route> {
        let route = self.by_id.remove(&id)?;
        if let Route::Udp(addr) = route {
            self.by_addr.remove(&addr);
        }
        Some(route)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
