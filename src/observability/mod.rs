//! # Observability
//!
//! Structured logging for the control plane via `tracing`.

pub mod logging;

pub use logging::{init_logging, log_config_info};
