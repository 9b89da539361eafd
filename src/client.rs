//! Blocking framed client.
//!
//! Speaks the same length-prefixed protocol as the server over a plain
//! `std::net::TcpStream`. Used by the integration tests.

use crate::error::FrameError;
use crate::protocol::frame::{read_frame, write_frame};
use crate::protocol::DEFAULT_MAX_PAYLOAD;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Default receive timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ChatClient {
    stream: TcpStream,
}

impl ChatClient {
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(Self { stream })
    }

    /// Send one framed command or message.
    pub fn send(&mut self, text: &str) -> Result<(), FrameError> {
        write_frame(&mut self.stream, text.as_bytes())
    }

    /// Write raw bytes, bypassing framing (file uploads).
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Receive one frame as text.
    pub fn recv(&mut self) -> Result<String, FrameError> {
        let payload = read_frame(&mut self.stream, DEFAULT_MAX_PAYLOAD)?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    /// Send and wait for the next frame.
    pub fn request(&mut self, text: &str) -> Result<String, FrameError> {
        self.send(text)?;
        self.recv()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}
