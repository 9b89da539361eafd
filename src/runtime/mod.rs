//! Event-loop runtimes for the chat relay.
//!
//! Two interchangeable backends drive the same `Dispatcher`:
//! - `mio_impl`: readiness-based I/O (epoll on Linux, kqueue on macOS)
//! - `uring`: completion-based I/O with io_uring (Linux only)
//!
//! Both share:
//! - `connection`: inbound state machine, outbound queue, id routing
//! - `bridge`: optional UDP bridge with multicast fan-out
//! - `deliver`: turning dispatcher output into encoded frames

pub mod bridge;
pub mod connection;
mod mio_impl;

#[cfg(target_os = "linux")]
mod token;
#[cfg(target_os = "linux")]
mod uring;

use crate::config::{Config, RuntimeType};
use crate::dispatcher::Outbound;
use crate::protocol::encode;
use crate::session::ConnectionId;
use bridge::UdpBridge;
use bytes::Bytes;
use connection::{Route, Routes};
use std::io;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Destination for frames bound to stream connections.
///
/// Each backend queues frames its own way; `deliver` only resolves routes.
pub(crate) trait TcpSink {
    /// Queue `frame` for the connection at slab `key`, if it is still `conn`.
    fn queue(&mut self, key: usize, conn: ConnectionId, frame: Bytes);
}

/// Encode and route dispatcher output.
pub(crate) fn deliver(
    outbound: Vec<Outbound>,
    routes: &Routes,
    bridge: Option<&UdpBridge>,
    sink: &mut impl TcpSink,
) {
    for item in outbound {
        match item {
            Outbound::Send { to, text } => {
                let frame = match encode(text.as_bytes()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(conn_id = %to, error = %e, "Failed to encode reply");
                        continue;
                    }
                };
                match routes.get(to) {
                    Some(Route::Tcp(key)) => sink.queue(key, to, frame),
                    Some(Route::Udp(addr)) => match bridge {
                        Some(bridge) => bridge.send_to(&frame, addr),
                        None => debug!(conn_id = %to, "No bridge for datagram peer"),
                    },
                    None => debug!(conn_id = %to, "Dropping frame for closed connection"),
                }
            }
            Outbound::Multicast { text } => {
                let Some(bridge) = bridge else {
                    continue;
                };
                match encode(text.as_bytes()) {
                    Ok(frame) => bridge.multicast(&frame),
                    Err(e) => warn!(error = %e, "Failed to encode group message"),
                }
            }
            Outbound::Upload { conn, .. } => {
                debug!(conn_id = %conn, "Upload request outside a stream, ignored");
            }
        }
    }
}

/// A bound server, ready to run on the calling thread.
pub enum Server {
    Mio(mio_impl::MioServer),
    #[cfg(target_os = "linux")]
    Uring(uring::UringServer),
}

impl Server {
    /// Bind every socket named by `config` using its selected runtime.
    pub fn bind(config: &Config) -> io::Result<Self> {
        match config.runtime {
            RuntimeType::Mio => Ok(Server::Mio(mio_impl::MioServer::bind(config)?)),
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => Ok(Server::Uring(uring::UringServer::bind(config)?)),
            #[cfg(not(target_os = "linux"))]
            RuntimeType::IoUring => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "io_uring runtime is only available on Linux",
            )),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Server::Mio(server) => server.local_addr(),
            #[cfg(target_os = "linux")]
            Server::Uring(server) => server.local_addr(),
        }
    }

    /// Address of the UDP bridge, when enabled.
    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        match self {
            Server::Mio(server) => server.bridge_addr(),
            #[cfg(target_os = "linux")]
            Server::Uring(server) => server.bridge_addr(),
        }
    }

    /// Serve until a fatal error.
    pub fn run(self) -> io::Result<()> {
        match self {
            Server::Mio(server) => server.run(),
            #[cfg(target_os = "linux")]
            Server::Uring(server) => server.run(),
        }
    }
}

/// Bind and run the server described by `config`.
pub fn run(config: Config) -> io::Result<()> {
    let server = Server::bind(&config)?;
    info!(addr = %server.local_addr()?, runtime = ?config.runtime, "Chat server listening");
    server.run()
}

/// Bind the UDP bridge if the configuration enables it.
pub(crate) fn bind_bridge(config: &Config) -> io::Result<Option<UdpBridge>> {
    config
        .bridge
        .as_ref()
        .map(|bridge| UdpBridge::bind(bridge.listen, bridge.group, config.max_message_size))
        .transpose()
}

/// Create the TCP listener.
fn create_listener(addr: SocketAddr, nonblocking: bool) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(nonblocking)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingSink {
        frames: HashMap<usize, Vec<(ConnectionId, Bytes)>>,
    }

    impl TcpSink for RecordingSink {
        fn queue(&mut self, key: usize, conn: ConnectionId, frame: Bytes) {
            self.frames.entry(key).or_default().push((conn, frame));
        }
    }

    #[test]
    fn test_deliver_routes_stream_frames() {
        let mut routes = Routes::new();
        let a = routes.open(Route::Tcp(3));
        let b = routes.open(Route::Tcp(4));
        routes.remove(b);

        let mut sink = RecordingSink::default();
        deliver(
            vec![
                Outbound::Send {
                    to: a,
                    text: "hi".into(),
                },
                Outbound::Send {
                    to: b,
                    text: "gone".into(),
                },
                Outbound::Multicast {
                    text: "no bridge".into(),
                },
            ],
            &routes,
            None,
            &mut sink,
        );

        assert_eq!(sink.frames.len(), 1);
        let (conn, frame) = &sink.frames[&3][0];
        assert_eq!(*conn, a);
        assert_eq!(&frame[..], b"00000000000000000002hi");
    }
}
