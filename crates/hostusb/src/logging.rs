//! Tracing subscriber setup

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use types::{Result, UsbError};

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides `default_level` when set. Call once per process,
/// typically from the host application's startup path.
pub fn setup_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| UsbError::Internal(format!("invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| UsbError::Internal(format!("failed to install subscriber: {}", e)))?;

    Ok(())
}
