//! chatmux: a multi-client chat relay.
//!
//! Clients speak a length-prefixed text protocol over TCP, or over UDP
//! through the optional bridge. Features:
//! - Unique display names and named channels
//! - Channel broadcast, direct messages and file upload
//! - Two event loops over the same dispatcher: mio (epoll/kqueue) and io_uring
//! - Configuration via CLI arguments or TOML file

pub mod channel;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod upload;

pub use config::{Config, RuntimeType};
pub use dispatcher::{Dispatcher, Outbound};
pub use runtime::Server;
