//! Error types for the chat relay.
//!
//! Three families, matching how far a failure is allowed to spread:
//! - `FrameError`: framing violations and lost transports, fatal to one connection
//! - `Rejected`: a command that could not be applied, reported to the sender
//! - `ConfigError`: startup configuration problems

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Framing and transport failures.
///
/// Every variant except `Io` with `ErrorKind::Interrupted` is fatal to the
/// connection that produced it.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Length header contained something other than ASCII digits.
    #[error("invalid length header: {0:?}")]
    InvalidHeader(String),

    /// Length header parsed to zero.
    #[error("frame length must be positive")]
    EmptyPayload,

    /// Length header exceeds the configured maximum.
    #[error("frame length {len} exceeds maximum {max}")]
    Oversize { len: usize, max: usize },

    /// Outbound payload length does not fit the 20-digit header.
    #[error("payload length {0} does not fit the length header")]
    HeaderOverflow(usize),

    /// Datagram carried bytes beyond the end of its frame.
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    /// Datagram ended before the frame was complete.
    #[error("frame truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    /// Peer stopped reading and its outbound queue hit the limit.
    #[error("outbound queue holds {queued} bytes, limit is {limit}")]
    Backlog { queued: usize, limit: usize },

    /// Peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True for malformed input, as opposed to a lost transport.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(
            self,
            FrameError::Closed | FrameError::Io(_) | FrameError::Backlog { .. }
        )
    }
}

/// A command that was understood but could not be applied.
///
/// The `Display` text is exactly what the sender receives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("Username cannot be created.")]
    EmptyName,

    #[error("Duplicate usernames are not allowed.")]
    DuplicateName,

    #[error("The channel name cannot be empty and cannot begin with a white space.")]
    InvalidChannelName,

    #[error("Duplicate channel names are not allowed.")]
    DuplicateChannel,

    #[error("Channel not found.")]
    ChannelNotFound,

    #[error("User not found.")]
    UserNotFound,

    #[error("You are not in a channel. Use /join first.")]
    NotInChannel,

    #[error("Invalid file name.")]
    InvalidFileName,

    #[error("File transfer requires a stream connection.")]
    UploadUnsupported,

    #[error("Invalid Command.")]
    InvalidCommand,
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid {field} address '{value}'")]
    InvalidAddress { field: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_text_is_response() {
        assert_eq!(Rejected::ChannelNotFound.to_string(), "Channel not found.");
        assert_eq!(
            Rejected::NotInChannel.to_string(),
            "You are not in a channel. Use /join first."
        );
    }

    #[test]
    fn test_protocol_violation_classification() {
        assert!(FrameError::EmptyPayload.is_protocol_violation());
        assert!(FrameError::Oversize { len: 2, max: 1 }.is_protocol_violation());
        assert!(!FrameError::Closed.is_protocol_violation());
        assert!(!FrameError::Backlog { queued: 9, limit: 8 }.is_protocol_violation());
        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(!FrameError::from(io).is_protocol_violation());
    }
}
