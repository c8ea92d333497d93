//! Tracing subscriber initialization.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::infrastructure::config::{ConfigError, LogConfig, LogFormat};

/// Initialize the global tracing subscriber from a [`LogConfig`].
///
/// `RUST_LOG` still wins over the configured default level.
pub fn init_tracing(config: &LogConfig) -> Result<(), ConfigError> {
    let default_level: tracing::Level = config
        .level
        .parse()
        .map_err(|_| ConfigError::InvalidLogLevel(config.level.clone()))?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    // try_init so tests initializing twice do not panic
    let _ = tracing_subscriber::registry().with(layer).try_init();
    Ok(())
}
