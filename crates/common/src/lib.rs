//! sqlgate common library
//!
//! This crate contains the error taxonomy, configuration and metrics shared by the
//! gateway components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{GatewayConfig, ADHOC_ROUTING_GROUP};
pub use error::{GatewayError, Result};
pub use metrics::{MetricsRegistry, METRICS};
