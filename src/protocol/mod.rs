//! Wire protocol: framing plus the chat command grammar.
//!
//! - `frame`: 20-byte length header + payload, incremental decoding
//! - `parser`: payload text into `Command`
//! - `response`: response text for successful commands

pub mod frame;
pub mod parser;
pub mod response;

pub use frame::{encode, FrameDecoder, DEFAULT_MAX_PAYLOAD, HEADER_LEN};
pub use parser::{Command, Parser};
pub use response::Response;
