//! Drives real servers over loopback with the blocking client.
//!
//! Every scenario runs against each available runtime. The io_uring runs
//! are skipped when the kernel refuses to create a ring.

use chatmux::client::ChatClient;
use chatmux::protocol::encode;
use chatmux::protocol::frame::decode_datagram;
use chatmux::{Config, RuntimeType, Server};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Running {
    addr: SocketAddr,
    bridge: Option<SocketAddr>,
}

fn runtimes() -> Vec<RuntimeType> {
    if cfg!(target_os = "linux") {
        vec![RuntimeType::Mio, RuntimeType::IoUring]
    } else {
        vec![RuntimeType::Mio]
    }
}

fn base_config(runtime: RuntimeType) -> Config {
    Config {
        listen: "127.0.0.1:0".parse().unwrap(),
        runtime,
        max_connections: 64,
        batch_size: 64,
        ring_size: 256,
        upload_dir: std::env::temp_dir().join("chatmux-test-uploads"),
        ..Config::default()
    }
}

/// Bind on a background thread; `None` when the runtime is unavailable.
fn start(config: Config) -> Option<Running> {
    let runtime = config.runtime;
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || match Server::bind(&config) {
        Ok(server) => {
            let addrs = server.local_addr().map(|addr| (addr, server.bridge_addr()));
            let _ = tx.send(addrs);
            let _ = server.run();
        }
        Err(e) => {
            let _ = tx.send(Err(e));
        }
    });

    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ok((addr, bridge)) => Some(Running { addr, bridge }),
        Err(e) if runtime == RuntimeType::IoUring => {
            eprintln!("skipping io_uring run: {e}");
            None
        }
        Err(e) => panic!("failed to start server: {e}"),
    }
}

fn client(server: &Running) -> ChatClient {
    ChatClient::connect(server.addr).unwrap()
}

/// Retry `check` until it passes or two seconds elapse.
fn eventually(check: impl FnMut() -> bool) -> bool {
    eventually_within(Duration::from_secs(2), check)
}

fn eventually_within(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn test_full_scenario() {
    for runtime in runtimes() {
        let Some(server) = start(base_config(runtime)) else {
            continue;
        };
        let mut ann = client(&server);

        assert!(ann.request("/name Ann").unwrap().contains("Welcome, Ann!"));
        assert_eq!(ann.request("/create Lobby").unwrap(), "Channel created.");
        // Nobody else is in the channel: no delivery and no error.
        ann.send("/message hi").unwrap();
        assert_eq!(ann.request("/list").unwrap(), "Channels:\n- Lobby");

        let mut bob = client(&server);
        assert_eq!(bob.request("/join Lobby").unwrap(), "Joined channel.");

        ann.send("/message hi").unwrap();
        let line = bob.recv().unwrap();
        assert!(line.contains("hi"));
        assert!(line.contains("Ann"));
        assert_eq!(line, "[Lobby] Ann: hi");
    }
}

#[test]
fn test_name_uniqueness_over_the_wire() {
    for runtime in runtimes() {
        let Some(server) = start(base_config(runtime)) else {
            continue;
        };
        let mut a = client(&server);
        let mut b = client(&server);

        assert_eq!(a.request("/name Ann").unwrap(), "Welcome, Ann!");
        assert_eq!(
            b.request("/name Ann").unwrap(),
            "Duplicate usernames are not allowed."
        );
        assert_eq!(b.request("/name").unwrap(), "Username cannot be created.");
    }
}

#[test]
fn test_prefix_safe_channels() {
    for runtime in runtimes() {
        let Some(server) = start(base_config(runtime)) else {
            continue;
        };
        let mut a = client(&server);
        let mut b = client(&server);

        a.request("/name Ann").unwrap();
        for name in ["Test Channel", "Test Channel23", "Test Channel 23"] {
            assert_eq!(a.request(&format!("/create {name}")).unwrap(), "Channel created.");
        }
        b.request("/name Bob").unwrap();
        assert_eq!(b.request("/join Test Channel 23").unwrap(), "Joined channel.");

        assert_eq!(
            b.request("/users").unwrap(),
            "Users in [Test Channel 23]:\n- Ann\n- Bob"
        );
        assert_eq!(
            a.request("/list").unwrap(),
            "Channels:\n- Test Channel\n- Test Channel 23\n- Test Channel23"
        );
    }
}

#[test]
fn test_broadcast_excludes_sender() {
    for runtime in runtimes() {
        let Some(server) = start(base_config(runtime)) else {
            continue;
        };
        let mut a = client(&server);
        let mut b = client(&server);
        let mut c = client(&server);

        a.request("/name Ann").unwrap();
        a.request("/create Lobby").unwrap();
        b.request("/join Lobby").unwrap();
        c.request("/join Lobby").unwrap();

        a.send("hello all").unwrap();
        assert_eq!(b.recv().unwrap(), "[Lobby] Ann: hello all");
        assert_eq!(c.recv().unwrap(), "[Lobby] Ann: hello all");
        // The next frame Ann sees is her own reply, not her broadcast.
        assert_eq!(a.request("/list").unwrap(), "Channels:\n- Lobby");
    }
}

#[test]
fn test_direct_message() {
    for runtime in runtimes() {
        let Some(server) = start(base_config(runtime)) else {
            continue;
        };
        let mut a = client(&server);
        let mut b = client(&server);

        a.request("/name Ann").unwrap();
        b.request("/name Bob").unwrap();

        a.send("/dm Bob psst").unwrap();
        assert_eq!(b.recv().unwrap(), "[DM] Ann: psst");
        assert_eq!(a.request("/dm Carl hi").unwrap(), "User not found.");
        assert_eq!(a.request("/shout").unwrap(), "Invalid Command.");
    }
}

#[test]
fn test_duplicate_channel_rejected() {
    for runtime in runtimes() {
        let Some(server) = start(base_config(runtime)) else {
            continue;
        };
        let mut a = client(&server);
        let mut b = client(&server);

        assert_eq!(a.request("/create X").unwrap(), "Channel created.");
        assert_eq!(
            a.request("/create X").unwrap(),
            "Duplicate channel names are not allowed."
        );
        assert_eq!(
            b.request("/create X").unwrap(),
            "Duplicate channel names are not allowed."
        );
        assert_eq!(b.request("/list").unwrap(), "Channels:\n- X");
    }
}

#[test]
fn test_disconnect_cleanup() {
    for runtime in runtimes() {
        let Some(server) = start(base_config(runtime)) else {
            continue;
        };
        let mut a = client(&server);
        let mut b = client(&server);

        a.request("/name Ann").unwrap();
        a.request("/create Lobby").unwrap();
        b.request("/name Bob").unwrap();
        b.request("/join Lobby").unwrap();
        drop(a);

        assert!(eventually(|| b.request("/users").unwrap() == "Users in [Lobby]:\n- Bob"));

        let mut c = client(&server);
        assert_eq!(c.request("/name Ann").unwrap(), "Welcome, Ann!");
    }
}

#[test]
fn test_protocol_violation_closes_connection() {
    for runtime in runtimes() {
        let Some(server) = start(base_config(runtime)) else {
            continue;
        };
        let mut a = client(&server);
        a.request("/name Ann").unwrap();

        // Zero-length frame.
        a.send_raw(b"00000000000000000000").unwrap();
        assert!(a.recv().is_err());

        let mut b = client(&server);
        assert!(eventually(|| b.request("/name Ann").unwrap() == "Welcome, Ann!"));
    }
}

#[test]
fn test_sized_upload() {
    for runtime in runtimes() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            upload_dir: dir.path().to_path_buf(),
            ..base_config(runtime)
        };
        let Some(server) = start(config) else {
            continue;
        };
        let mut a = client(&server);

        a.send("/sendfile ../notes.txt 11").unwrap();
        a.send_raw(b"hello world").unwrap();
        assert_eq!(a.recv().unwrap(), "Upload done.");

        // Framing resumes right after the drained bytes.
        assert_eq!(a.request("/list").unwrap(), "Channels:");
        let path: PathBuf = dir.path().join("notes.txt");
        assert_eq!(std::fs::read(path).unwrap(), b"hello world");
    }
}

#[test]
fn test_reader_that_never_reads_is_dropped() {
    for runtime in runtimes() {
        let config = Config {
            max_message_size: 16 * 1024,
            max_outbox_bytes: 64 * 1024,
            ..base_config(runtime)
        };
        let Some(server) = start(config) else {
            continue;
        };
        let mut ann = client(&server);
        let mut sink = client(&server);

        ann.request("/name Ann").unwrap();
        ann.request("/create Lobby").unwrap();
        sink.request("/name Sink").unwrap();
        sink.request("/join Lobby").unwrap();

        // Far more than the socket buffers and the outbox can hold.
        let text = "x".repeat(15_000);
        for _ in 0..2_000 {
            ann.send(&text).unwrap();
        }

        let mut other = client(&server);
        assert!(eventually_within(Duration::from_secs(10), || {
            other.request("/name Sink").unwrap() == "Welcome, Sink!"
        }));
        // The sender is unaffected.
        assert_eq!(ann.request("/users").unwrap(), "Users in [Lobby]:\n- Ann");
        drop(sink);
    }
}

fn udp_peer() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

fn recv_datagram(socket: &UdpSocket) -> io::Result<String> {
    let mut buf = [0u8; 2048];
    let n = socket.recv(&mut buf)?;
    let payload = decode_datagram(&buf[..n], 1024 * 1024)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(String::from_utf8_lossy(&payload).into_owned())
}

#[test]
fn test_bridge_multicast_fan_out_by_one() {
    for runtime in runtimes() {
        // A plain local socket stands in for the multicast group.
        let group = udp_peer();
        let mut config = base_config(runtime);
        config.bridge = Some(chatmux::config::BridgeConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            group: group.local_addr().unwrap(),
        });
        let Some(server) = start(config) else {
            continue;
        };
        let bridge = server.bridge.unwrap();

        let mut ann = client(&server);
        let mut bob = client(&server);
        ann.request("/name Ann").unwrap();
        ann.request("/create Lobby").unwrap();
        bob.request("/join Lobby").unwrap();

        let peers = [udp_peer(), udp_peer()];
        for peer in &peers {
            // Anything before the handshake is ignored.
            peer.send_to(&encode(b"/list").unwrap(), bridge).unwrap();
            peer.send_to(b"/connect", bridge).unwrap();
            assert_eq!(recv_datagram(peer).unwrap(), "Connected.");

            peer.send_to(&encode(b"/join Lobby").unwrap(), bridge).unwrap();
            assert_eq!(recv_datagram(peer).unwrap(), "Joined channel.");
        }

        ann.send("hi").unwrap();
        assert_eq!(bob.recv().unwrap(), "[Lobby] Ann: hi");
        assert_eq!(recv_datagram(&group).unwrap(), "[Lobby] Ann: hi");

        // Exactly one group datagram for both bridged members.
        group
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        assert!(recv_datagram(&group).is_err());

        // Direct messages to a bridged peer travel by unicast.
        peers[0]
            .send_to(&encode(b"/name Udo").unwrap(), bridge)
            .unwrap();
        assert_eq!(recv_datagram(&peers[0]).unwrap(), "Welcome, Udo!");
        ann.send("/dm Udo hey").unwrap();
        assert_eq!(recv_datagram(&peers[0]).unwrap(), "[DM] Ann: hey");

        // Uploads need a stream.
        peers[1]
            .send_to(&encode(b"/sendfile a.txt 3").unwrap(), bridge)
            .unwrap();
        assert_eq!(
            recv_datagram(&peers[1]).unwrap(),
            "File transfer requires a stream connection."
        );
    }
}
