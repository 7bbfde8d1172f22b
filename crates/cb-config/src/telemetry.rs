//! Global tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{ConfigError, LogSettings};

/// Installs the subscriber once per process. `RUST_LOG` wins over the
/// configured filter when set.
pub fn init(log: &LogSettings) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .map_err(|e| ConfigError::Telemetry(e.to_string()))?;

    let result = if log.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    result.map_err(|e| ConfigError::Telemetry(e.to_string()))
}
