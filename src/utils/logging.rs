//! Structured logging setup on top of `tracing-subscriber`.
//!
//! The library itself only emits `tracing` events; binaries and tests call
//! [`init_logging`] once to install a subscriber. `RUST_LOG` takes precedence
//! over the configured level.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber described by `config`.
///
/// Fails with `ConfigError` if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| {
        ProtocolError::ConfigError(format!(
            "Failed to install subscriber for {}: {e}",
            config.app_name
        ))
    })
}
