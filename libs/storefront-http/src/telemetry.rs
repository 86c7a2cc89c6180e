//! Global `tracing` subscriber setup.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::ApiError;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber: `RUST_LOG` wins over `config.level`,
/// output is text or JSON per `config.format`.
///
/// Call once at startup, before building services.
///
/// # Errors
/// `ApiError::Config` for an unparsable level directive or when a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ApiError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| ApiError::Config(format!("invalid log level '{}': {e}", config.level)))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
    };
    installed.map_err(|e| ApiError::Config(format!("logging already initialized: {e}")))?;

    tracing::debug!(level = %config.level, format = ?config.format, "logging initialized");
    Ok(())
}
