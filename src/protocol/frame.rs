//! Length-prefixed framing.
//!
//! Every message in either direction is a 20-byte ASCII decimal length,
//! zero-padded on the left, followed by exactly that many payload bytes:
//!
//! ```text
//! 00000000000000000005hello
//! ```
//!
//! There is no terminator; the header is authoritative. `FrameDecoder`
//! accepts input in arbitrary chunks so the event loops never have to assume
//! a read returns a whole header or a whole payload.

use crate::error::FrameError;
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Width of the length header in bytes.
pub const HEADER_LEN: usize = 20;

/// Default upper bound on a single payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Encode a payload into a complete frame.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    let header = format!("{:0width$}", payload.len(), width = HEADER_LEN);
    if header.len() != HEADER_LEN {
        return Err(FrameError::HeaderOverflow(payload.len()));
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

/// Parse a length header, enforcing `0 < len <= max_payload`.
pub fn parse_header(header: &[u8; HEADER_LEN], max_payload: usize) -> Result<usize, FrameError> {
    if !header.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::InvalidHeader(
            String::from_utf8_lossy(header).into_owned(),
        ));
    }

    // Twenty digits can exceed u64::MAX, so accumulate wider.
    let len = header
        .iter()
        .fold(0u128, |acc, digit| acc * 10 + u128::from(digit - b'0'));

    if len == 0 {
        return Err(FrameError::EmptyPayload);
    }
    if len > max_payload as u128 {
        return Err(FrameError::Oversize {
            len: usize::try_from(len).unwrap_or(usize::MAX),
            max: max_payload,
        });
    }

    Ok(len as usize)
}

#[derive(Debug)]
enum DecodeState {
    /// Collecting the 20-byte header.
    AwaitingLength {
        header: [u8; HEADER_LEN],
        filled: usize,
    },
    /// Collecting `len` payload bytes.
    AwaitingPayload { payload: BytesMut, len: usize },
}

impl DecodeState {
    fn awaiting_length() -> Self {
        DecodeState::AwaitingLength {
            header: [0u8; HEADER_LEN],
            filled: 0,
        }
    }
}

/// Incremental two-phase frame decoder.
///
/// `feed` never consumes past the end of the frame it completes, so the
/// caller can hand the remainder of a read to something else (the upload
/// drain takes over a connection right after a `/sendfile` frame).
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: DecodeState::awaiting_length(),
            max_payload,
        }
    }

    /// Bytes still needed to finish the current phase (header or payload).
    pub fn wanted(&self) -> usize {
        match &self.state {
            DecodeState::AwaitingLength { filled, .. } => HEADER_LEN - filled,
            DecodeState::AwaitingPayload { payload, len } => len - payload.len(),
        }
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::AwaitingLength { filled: 0, .. })
    }

    /// Feed input, returning bytes consumed and the completed payload, if any.
    ///
    /// Stops at the first completed frame; call again with the unconsumed
    /// tail to continue.
    pub fn feed(&mut self, input: &[u8]) -> Result<(usize, Option<Bytes>), FrameError> {
        let mut consumed = 0;

        while consumed < input.len() {
            let rest = &input[consumed..];
            match &mut self.state {
                DecodeState::AwaitingLength { header, filled } => {
                    let take = (HEADER_LEN - *filled).min(rest.len());
                    header[*filled..*filled + take].copy_from_slice(&rest[..take]);
                    *filled += take;
                    consumed += take;

                    if *filled == HEADER_LEN {
                        let len = parse_header(header, self.max_payload)?;
                        self.state = DecodeState::AwaitingPayload {
                            payload: BytesMut::with_capacity(len),
                            len,
                        };
                    }
                }
                DecodeState::AwaitingPayload { payload, len } => {
                    let take = (*len - payload.len()).min(rest.len());
                    payload.extend_from_slice(&rest[..take]);
                    consumed += take;

                    if payload.len() == *len {
                        let frame = std::mem::take(payload).freeze();
                        self.state = DecodeState::awaiting_length();
                        return Ok((consumed, Some(frame)));
                    }
                }
            }
        }

        Ok((consumed, None))
    }
}

/// Decode a datagram that must carry exactly one frame.
pub fn decode_datagram(datagram: &[u8], max_payload: usize) -> Result<Bytes, FrameError> {
    if datagram.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            needed: HEADER_LEN - datagram.len(),
        });
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&datagram[..HEADER_LEN]);
    let len = parse_header(&header, max_payload)?;

    let body = &datagram[HEADER_LEN..];
    if body.len() < len {
        return Err(FrameError::Truncated {
            needed: len - body.len(),
        });
    }
    if body.len() > len {
        return Err(FrameError::TrailingBytes(body.len() - len));
    }

    Ok(Bytes::copy_from_slice(body))
}

/// Read one frame from a blocking reader.
pub fn read_frame<R: Read>(reader: &mut R, max_payload: usize) -> Result<Bytes, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    read_full(reader, &mut header)?;
    let len = parse_header(&header, max_payload)?;

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload)?;
    Ok(Bytes::from(payload))
}

/// Write one frame to a blocking writer.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let frame = encode(payload)?;
    writer.write_all(&frame)?;
    Ok(())
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(FrameError::Closed),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
