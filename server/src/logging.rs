//! Structured logging initialization.
//!
//! Configures the tracing subscriber from server configuration. The
//! RUST_LOG environment variable takes precedence over the configured
//! level.

use std::fs::File;
use std::io;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::LogDestination;

/// Initialize the logging subsystem.
pub fn init(level: &str, destination: &LogDestination) -> io::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match destination {
        LogDestination::Stderr => builder.with_writer(io::stderr).init(),
        LogDestination::Stdout => builder.with_writer(io::stdout).init(),
        LogDestination::File(path) => {
            let file = File::options().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
    }
    Ok(())
}
