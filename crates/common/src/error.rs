//! Common error types for sqlgate
//!
//! This module defines all error types used across the gateway.
//! Every error maps to an HTTP status so the forwarding layer can answer the client.

use http::StatusCode;
use thiserror::Error;

/// Main error type for sqlgate
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Every backend-selection path was exhausted
    #[error("No backends available: {0}")]
    NoBackendsAvailable(String),

    /// HTTP transport errors (probes, telemetry fetches)
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A backend answered with a status we cannot use
    #[error("Unexpected status {status} from {target}")]
    UnexpectedStatus { status: u16, target: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Routing rule source could not be loaded or compiled
    #[error("Routing rules error: {0}")]
    Rules(String),

    /// Affinity persistence failures
    #[error("Affinity store error: {0}")]
    Store(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Parse(err.to_string())
    }
}

impl GatewayError {
    /// Convert error to the HTTP status the client should see
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoBackendsAvailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Transport(_) | GatewayError::UnexpectedStatus { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Config(_)
            | GatewayError::Serialization(_)
            | GatewayError::Io(_)
            | GatewayError::Rules(_)
            | GatewayError::Store(_)
            | GatewayError::Parse(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error means the request cannot be routed at all
    pub fn is_fatal_for_request(&self) -> bool {
        matches!(self, GatewayError::NoBackendsAvailable(_))
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    /// Create a no-backends error
    pub fn no_backends(msg: impl Into<String>) -> Self {
        GatewayError::NoBackendsAvailable(msg.into())
    }

    /// Create a routing rules error
    pub fn rules(msg: impl Into<String>) -> Self {
        GatewayError::Rules(msg.into())
    }

    /// Create an affinity store error
    pub fn store(msg: impl Into<String>) -> Self {
        GatewayError::Store(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        GatewayError::Timeout(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        GatewayError::Parse(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
