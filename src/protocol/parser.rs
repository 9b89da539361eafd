//! Chat command grammar.
//!
//! A payload is split once into a command token (up to the first whitespace)
//! and a trimmed argument remainder, then mapped into `Command`:
//!
//! - Identity: `/name <name>`
//! - Channels: `/create <channel>`, `/join <channel>`, `/list`, `/users`
//! - Messaging: `/dm <user> <text>` (alias `/msg`), `/message <text>`, bare text
//! - Other: `/help`, `/sendfile <file> [bytes]`, `/connect`

/// Parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Claim a display name (argument may be empty; validated later).
    Name(String),

    /// Create a channel and move into it.
    Create(String),

    /// Move into an existing channel.
    Join(String),

    /// List channel names.
    List,

    /// List members of the current channel.
    Users,

    /// Private message to one user.
    DirectMessage { to: String, text: String },

    /// Channel broadcast.
    Message(String),

    /// Show the command summary.
    Help,

    /// Stream a file to the server's upload directory.
    SendFile { filename: String, size: Option<u64> },

    /// Bridge handshake.
    Connect,

    /// Anything not recognised.
    Invalid,
}

/// Parser for chat payloads.
pub struct Parser;

impl Parser {
    /// Parse one payload.
    ///
    /// With `bare_text_chat`, text that does not start with `/` is a channel
    /// message; otherwise it is invalid.
    pub fn parse(payload: &str, bare_text_chat: bool) -> Command {
        let (token, args) = split_command(payload);

        if !token.starts_with('/') {
            let text = payload.trim();
            return if bare_text_chat && !text.is_empty() {
                Command::Message(text.to_string())
            } else {
                Command::Invalid
            };
        }

        match token {
            "/name" => Command::Name(args.to_string()),
            "/create" => Command::Create(args.to_string()),
            "/join" => Command::Join(args.to_string()),
            "/list" => Command::List,
            "/users" => Command::Users,
            "/help" => Command::Help,
            "/connect" => Command::Connect,
            "/dm" | "/msg" => Self::parse_direct(args),
            "/message" => {
                if args.is_empty() {
                    Command::Invalid
                } else {
                    Command::Message(args.to_string())
                }
            }
            "/sendfile" => Self::parse_sendfile(args),
            _ => Command::Invalid,
        }
    }

    /// Parse `<user> <text>`; a leading `@` on the user is dropped.
    fn parse_direct(args: &str) -> Command {
        let (to, text) = split_command(args);
        let to = to.strip_prefix('@').unwrap_or(to);
        if to.is_empty() || text.is_empty() {
            return Command::Invalid;
        }
        Command::DirectMessage {
            to: to.to_string(),
            text: text.to_string(),
        }
    }

    /// Parse `<filename> [bytes]`.
    fn parse_sendfile(args: &str) -> Command {
        let parts: Vec<&str> = args.split_whitespace().collect();
        match parts.as_slice() {
            [filename] => Command::SendFile {
                filename: filename.to_string(),
                size: None,
            },
            [filename, size] => match size.parse::<u64>() {
                Ok(size) => Command::SendFile {
                    filename: filename.to_string(),
                    size: Some(size),
                },
                Err(_) => Command::Invalid,
            },
            _ => Command::Invalid,
        }
    }
}

/// Split into the token before the first whitespace and the trimmed rest.
fn split_command(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(pos) => (&input[..pos], input[pos..].trim()),
        None => (input, ""),
    }
}
