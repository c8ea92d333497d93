//! Infrastructure: configuration and logging.

pub mod config;
pub mod logging;

pub use config::{ConfigError, FlowConfig, LockSettings, LogConfig, LogFormat};
