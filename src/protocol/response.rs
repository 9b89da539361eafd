//! Response text generation.
//!
//! Rejections render through `Rejected`'s `Display`; everything a successful
//! command sends back is built here.

/// Response generator for chat commands
pub struct Response;

impl Response {
    /// Generate the name confirmation
    pub fn welcome(name: &str) -> String {
        format!("Welcome, {name}!")
    }

    pub fn channel_created() -> &'static str {
        "Channel created."
    }

    pub fn joined_channel() -> &'static str {
        "Joined channel."
    }

    pub fn connected() -> &'static str {
        "Connected."
    }

    pub fn upload_done() -> &'static str {
        "Upload done."
    }

    pub fn upload_failed() -> &'static str {
        "Upload failed."
    }

    /// Generate the channel listing
    pub fn channel_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
        let mut out = String::from("Channels:");
        for name in names {
            out.push_str("\n- ");
            out.push_str(name);
        }
        out
    }

    /// Generate the member listing for a channel
    pub fn user_list(channel: &str, names: &[String]) -> String {
        let mut out = format!("Users in [{channel}]:");
        for name in names {
            out.push_str("\n- ");
            out.push_str(name);
        }
        out
    }

    /// Generate a channel broadcast line
    pub fn channel_message(channel: &str, sender: &str, text: &str) -> String {
        format!("[{channel}] {sender}: {text}")
    }

    /// Generate a direct message line
    pub fn direct_message(sender: &str, text: &str) -> String {
        format!("[DM] {sender}: {text}")
    }

    pub fn help() -> &'static str {
        "Available commands:\n\
         /name <name>              - Set your display name\n\
         /list                     - List available channels\n\
         /create <name>            - Create a new channel and join it\n\
         /join <name>              - Join a channel\n\
         /users                    - List users in current channel\n\
         /dm <user> <message>      - Send a private message\n\
         /message <text>           - Send a message to your channel\n\
         /sendfile <file> [bytes]  - Upload a file\n\
         /help                     - Show this help message"
    }
}
