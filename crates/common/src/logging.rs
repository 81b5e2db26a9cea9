//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Build the filter from `RUST_LOG`, falling back to `default_level`
pub fn build_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}

/// Setup tracing subscriber for the application
///
/// Output goes to stderr so that machine-readable output on stdout stays clean.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = build_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))?;

    Ok(())
}
