//! Logging setup.
//!
//! All diagnostics go through `tracing` with structured fields. The
//! subscriber is installed exactly once at startup, before any other
//! subsystem runs; the level comes from the finalized configuration
//! with a `CTS_LOG_LEVEL` environment override.

use tracing_subscriber::EnvFilter;

use crate::errors::BoxError;

/// Environment variable overriding the configured log level.
pub const LOG_LEVEL_ENV: &str = "CTS_LOG_LEVEL";

/// Installs the global tracing subscriber.
///
/// `level` is a tracing filter directive (`"info"`, `"debug"`,
/// `"consul_terraform_sync=trace"`, ...). With `json` set, log lines are
/// emitted as JSON objects for machine collection.
pub fn setup(level: &str, json: bool) -> Result<(), BoxError> {
    let filter = match std::env::var(LOG_LEVEL_ENV) {
        Ok(env_level) if !env_level.is_empty() => EnvFilter::try_new(env_level)?,
        _ => EnvFilter::try_new(level)?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().try_init()?;
    } else {
        builder.try_init()?;
    }
    Ok(())
}
