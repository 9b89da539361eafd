//! Configuration module for the chatmux server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::protocol::DEFAULT_MAX_PAYLOAD;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Event-loop backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    /// Readiness-based (epoll/kqueue)
    #[default]
    Mio,
    /// Completion-based io_uring (Linux only)
    IoUring,
}

/// Command-line arguments for the chat server
#[derive(Parser, Debug)]
#[command(name = "chatmux")]
#[command(version = "0.1.0")]
#[command(about = "A multi-client chat relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8060)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Event-loop backend
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Maximum simultaneous TCP connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum payload size in bytes
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Unsent bytes a connection may queue before it is dropped
    #[arg(long)]
    pub max_outbox_bytes: Option<usize>,

    /// Directory for /sendfile uploads
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Enable the UDP bridge
    #[arg(long)]
    pub bridge: bool,

    /// Address for the UDP bridge socket
    #[arg(long)]
    pub bridge_listen: Option<String>,

    /// Multicast group for bridged channel broadcasts
    #[arg(long)]
    pub multicast_group: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TomlConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub runtime: RuntimeType,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Unsent bytes a connection may queue before it is dropped
    #[serde(default = "default_max_outbox_bytes")]
    pub max_outbox_bytes: usize,
    /// Treat text without a leading `/` as a channel message
    #[serde(default = "default_true")]
    pub bare_text_chat: bool,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            runtime: RuntimeType::default(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            max_outbox_bytes: default_max_outbox_bytes(),
            bare_text_chat: true,
            upload_dir: default_upload_dir(),
        }
    }
}

/// Event-loop tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Completions or readiness events handled per loop iteration
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// io_uring submission queue entries
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            ring_size: default_ring_size(),
        }
    }
}

/// UDP bridge configuration
#[derive(Debug, Deserialize)]
pub struct BridgeSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bridge_listen")]
    pub listen: String,
    #[serde(default = "default_group")]
    pub group: String,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_bridge_listen(),
            group: default_group(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8060".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_PAYLOAD
}

fn default_max_outbox_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_batch_size() -> usize {
    256
}

fn default_ring_size() -> u32 {
    1024
}

fn default_bridge_listen() -> String {
    "0.0.0.0:8061".to_string()
}

fn default_group() -> String {
    "224.1.1.1:12345".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved UDP bridge addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub listen: SocketAddr,
    pub group: SocketAddr,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub runtime: RuntimeType,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub max_outbox_bytes: usize,
    pub batch_size: usize,
    pub ring_size: u32,
    pub bare_text_chat: bool,
    pub upload_dir: PathBuf,
    pub bridge: Option<BridgeConfig>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8060)),
            runtime: RuntimeType::default(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            max_outbox_bytes: default_max_outbox_bytes(),
            batch_size: default_batch_size(),
            ring_size: default_ring_size(),
            bare_text_chat: true,
            upload_dir: default_upload_dir(),
            bridge: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = match &cli.config {
            Some(path) => TomlConfig::from_file(path)?,
            None => TomlConfig::default(),
        };
        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            runtime,
            bridge,
            logging,
        } = toml_config;

        let listen = cli.listen.unwrap_or(server.listen);
        let bridge = if cli.bridge || bridge.enabled {
            let listen = cli.bridge_listen.unwrap_or(bridge.listen);
            let group = cli.multicast_group.unwrap_or(bridge.group);
            Some(BridgeConfig {
                listen: parse_addr("bridge listen", &listen)?,
                group: parse_addr("multicast group", &group)?,
            })
        } else {
            None
        };

        Ok(Config {
            listen: parse_addr("listen", &listen)?,
            runtime: cli.runtime.unwrap_or(server.runtime),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            max_message_size: cli.max_message_size.unwrap_or(server.max_message_size),
            max_outbox_bytes: cli.max_outbox_bytes.unwrap_or(server.max_outbox_bytes),
            batch_size: runtime.batch_size.max(1),
            ring_size: runtime.ring_size,
            bare_text_chat: server.bare_text_chat,
            upload_dir: cli.upload_dir.unwrap_or(server.upload_dir),
            bridge,
            log_level: cli.log_level.unwrap_or(logging.level),
        })
    }
}

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["chatmux"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:8060");
        assert_eq!(config.server.runtime, RuntimeType::Mio);
        assert_eq!(config.server.max_message_size, 1024 * 1024);
        assert_eq!(config.server.max_outbox_bytes, 8 * 1024 * 1024);
        assert!(config.server.bare_text_chat);
        assert!(!config.bridge.enabled);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9000"
            runtime = "io-uring"
            max_connections = 64
            max_outbox_bytes = 65536
            bare_text_chat = false

            [runtime]
            batch_size = 32
            ring_size = 256

            [bridge]
            enabled = true
            group = "239.0.0.1:5000"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.runtime, RuntimeType::IoUring);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.max_outbox_bytes, 65536);
        assert!(!config.server.bare_text_chat);
        assert_eq!(config.runtime.batch_size, 32);
        assert_eq!(config.runtime.ring_size, 256);
        assert!(config.bridge.enabled);
        assert_eq!(config.bridge.listen, "0.0.0.0:8061");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nlisten = \"127.0.0.1:9000\"\nruntime = \"io-uring\"\n[logging]\nlevel = \"warn\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let config = Config::from_args(cli(&[
            "-c",
            path,
            "-l",
            "127.0.0.1:7000",
            "-r",
            "mio",
            "--max-outbox-bytes",
            "4096",
        ]))
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.max_outbox_bytes, 4096);
        assert_eq!(config.runtime, RuntimeType::Mio);
        assert_eq!(config.log_level, "warn");
        assert!(config.bridge.is_none());
    }

    #[test]
    fn test_bridge_from_cli() {
        let config = Config::from_args(cli(&[
            "--bridge",
            "--bridge-listen",
            "127.0.0.1:0",
            "--multicast-group",
            "224.1.1.1:12345",
        ]))
        .unwrap();
        let bridge = config.bridge.unwrap();
        assert_eq!(bridge.group, "224.1.1.1:12345".parse().unwrap());
    }

    #[test]
    fn test_invalid_address() {
        let err = Config::from_args(cli(&["-l", "not-an-address"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { field: "listen", .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_args(cli(&["-c", "/nonexistent/chatmux.toml"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }
}
