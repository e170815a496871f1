//! choder: a single-threaded text-protocol control server
//!
//! Clients speak a line-oriented command protocol modeled after FTP:
//! - USER, INFO, WHO, ECHO for session chatter
//! - PORT to open a data channel back to the client
//! - LIST and FILE to move directory listings and file contents over it
//!
//! Features:
//! - One mio event loop multiplexing every socket, including data channels
//! - Partial reads and writes buffered per connection
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;
mod shutdown;

use config::Config;
use tracing::{info, warn};
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
        root = %config.root.display(),
        max_connections = config.max_connections,
        "Starting choder server"
    );

    runtime::run(&config, shutdown::install, shutdown::requested)?;

    warn!("Interrupted, shutting down");
    eprintln!("choder: interrupted, exiting with status {}", shutdown::EXIT_INTERRUPTED);
    std::process::exit(shutdown::EXIT_INTERRUPTED);
}
