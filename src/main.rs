//! chatmux server binary.

use chatmux::{runtime, Config};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        runtime = ?config.runtime,
        max_connections = config.max_connections,
        max_message_size = config.max_message_size,
        bridge = ?config.bridge,
        upload_dir = %config.upload_dir.display(),
        "Starting chatmux server"
    );

    runtime::run(config)?;
    Ok(())
}
