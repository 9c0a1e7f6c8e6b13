//! Error types for the two-stage DiD workspace

use thiserror::Error;

/// Estimator error type
#[derive(Error, Debug)]
pub enum Error {
    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed input data
    #[error("Validation error: {0}")]
    Validation(String),

    /// Inconsistent or unknown configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Model is not identified on the supplied data
    #[error("Estimation error: {0}")]
    Estimation(String),

    /// Numerical failure
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
