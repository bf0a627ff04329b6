//! Logging and health endpoints.

pub mod health;
pub mod logging;

pub use health::{HealthServer, WorkerStatus};
pub use logging::{init_default_logging, init_logging, LogFormat};
