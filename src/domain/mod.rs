//! Domain layer: models, ports and errors of the orchestration core.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{FlowError, FlowResult};
