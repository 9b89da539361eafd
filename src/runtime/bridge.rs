//! UDP bridge.
//!
//! Datagram peers join the chat through one non-blocking UDP socket. An
//! unknown sender must open with `/connect` (framed, or as raw text) before
//! anything else it sends is dispatched; after that every datagram must
//! carry exactly one frame. Replies and direct messages go back by unicast.
//! Channel broadcasts reach all bridged members through a single datagram to
//! the multicast group. Delivery is best-effort in both directions.

use crate::dispatcher::{Dispatcher, Outbound};
use crate::protocol::frame::decode_datagram;
use crate::protocol::Response;
use crate::runtime::connection::{Route, Routes};
use crate::session::Transport;
use mio::net::UdpSocket;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, info, warn};

/// Largest datagram the bridge will read.
const MAX_DATAGRAM: usize = 64 * 1024;

const CONNECT: &[u8] = b"/connect";

pub struct UdpBridge {
    socket: UdpSocket,
    group: SocketAddr,
    max_payload: usize,
    buf: Vec<u8>,
}

impl UdpBridge {
    /// Bind the bridge socket and prepare it for group sends.
    pub fn bind(listen: SocketAddr, group: SocketAddr, max_payload: usize) -> io::Result<Self> {
        let socket = create_bridge_socket(listen)?;
        let socket = UdpSocket::from_std(socket);
        info!(addr = %socket.local_addr()?, group = %group, "UDP bridge listening");

        Ok(Self {
            socket,
            group,
            max_payload,
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn socket_mut(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }

    /// Read every pending datagram and dispatch what it carries.
    pub fn recv_all(&mut self, routes: &mut Routes, dispatcher: &mut Dispatcher) -> Vec<Outbound> {
        let mut out = Vec::new();

        loop {
            let (n, peer) = match self.socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Bridge receive failed");
                    break;
                }
            };
            let datagram = &self.buf[..n];

            match routes.peer(&peer) {
                Some(conn) => match decode_datagram(datagram, self.max_payload) {
                    Ok(payload) => out.extend(dispatcher.dispatch(conn, &payload)),
                    Err(e) => {
                        debug!(conn_id = %conn, peer = %peer, error = %e, "Dropping bridged peer");
                        routes.remove(conn);
                        dispatcher.disconnect(conn);
                    }
                },
                None if is_handshake(datagram, self.max_payload) => {
                    let conn = routes.open(Route::Udp(peer));
                    dispatcher.connect(conn, Transport::Udp);
                    debug!(conn_id = %conn, peer = %peer, "Bridged peer connected");
                    out.push(Outbound::Send {
                        to: conn,
                        text: Response::connected().to_string(),
                    });
                }
                None => debug!(peer = %peer, "Ignoring datagram from unknown peer"),
            }
        }

        out
    }

    /// Unicast one encoded frame.
    pub fn send_to(&self, frame: &[u8], addr: SocketAddr) {
        if let Err(e) = self.socket.send_to(frame, addr) {
            warn!(peer = %addr, error = %e, "Bridge send failed");
        }
    }

    /// Send one encoded frame to the multicast group.
    pub fn multicast(&self, frame: &[u8]) {
        self.send_to(frame, self.group);
    }
}

impl AsRawFd for UdpBridge {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// `/connect`, either framed or raw.
fn is_handshake(datagram: &[u8], max_payload: usize) -> bool {
    match decode_datagram(datagram, max_payload) {
        Ok(payload) => payload.starts_with(CONNECT),
        Err(_) => datagram.starts_with(CONNECT),
    }
}

/// Create a non-blocking UDP socket with group sends looped back locally.
fn create_bridge_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_reuse_address(true)?;
    if addr.is_ipv4() {
        socket.set_multicast_ttl_v4(1)?;
        socket.set_multicast_loop_v4(true)?;
    } else {
        socket.set_multicast_loop_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;
    use crate::protocol::frame::read_frame;
    use std::net::UdpSocket as StdUdpSocket;
    use std::time::{Duration, Instant};

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn peer() -> StdUdpSocket {
        let socket = StdUdpSocket::bind(local()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    /// Poll the non-blocking bridge until it yields deliveries or times out.
    fn pump(bridge: &mut UdpBridge, routes: &mut Routes, d: &mut Dispatcher) -> Vec<Outbound> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let out = bridge.recv_all(routes, d);
            if !out.is_empty() || Instant::now() > deadline {
                return out;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_handshake_and_unknown_peer() {
        let group = peer();
        let mut bridge = UdpBridge::bind(local(), group.local_addr().unwrap(), 1024).unwrap();
        let bridge_addr = bridge.local_addr().unwrap();
        let mut routes = Routes::new();
        let mut dispatcher = Dispatcher::new(true);

        let stranger = peer();
        stranger.send_to(&encode(b"/list").unwrap(), bridge_addr).unwrap();
        let client = peer();
        client.send_to(b"/connect", bridge_addr).unwrap();

        let out = pump(&mut bridge, &mut routes, &mut dispatcher);
        let conn = routes.peer(&client.local_addr().unwrap()).unwrap();
        assert_eq!(
            out,
            vec![Outbound::Send {
                to: conn,
                text: "Connected.".into()
            }]
        );
        assert!(routes.peer(&stranger.local_addr().unwrap()).is_none());
        assert_eq!(dispatcher.sessions().transport(conn), Transport::Udp);
    }

    #[test]
    fn test_violation_forgets_peer() {
        let group = peer();
        let mut bridge = UdpBridge::bind(local(), group.local_addr().unwrap(), 1024).unwrap();
        let bridge_addr = bridge.local_addr().unwrap();
        let mut routes = Routes::new();
        let mut dispatcher = Dispatcher::new(true);

        let client = peer();
        client.send_to(&encode(b"/connect").unwrap(), bridge_addr).unwrap();
        pump(&mut bridge, &mut routes, &mut dispatcher);
        let conn = routes.peer(&client.local_addr().unwrap()).unwrap();

        // Two frames in one datagram.
        let mut doubled = encode(b"/list").unwrap().to_vec();
        doubled.extend_from_slice(&encode(b"/list").unwrap());
        client.send_to(&doubled, bridge_addr).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        bridge.recv_all(&mut routes, &mut dispatcher);

        assert!(routes.get(conn).is_none());
        assert!(!dispatcher.sessions().contains(conn));
    }

    #[test]
    fn test_multicast_reaches_group() {
        let group = peer();
        let bridge = UdpBridge::bind(local(), group.local_addr().unwrap(), 1024).unwrap();

        bridge.multicast(&encode(b"[Lobby] Ann: hi").unwrap());

        let mut buf = [0u8; 128];
        let n = group.recv(&mut buf).unwrap();
        let payload = read_frame(&mut &buf[..n], 1024).unwrap();
        assert_eq!(&payload[..], b"[Lobby] Ann: hi");
    }
}
