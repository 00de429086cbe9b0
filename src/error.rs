//! Error types for Tollgate.

use thiserror::Error;

/// Errors returned by the rate limiter core.
///
/// Running out of tokens is not an error: `allow` reports it as `Ok(false)`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LimiterError {
    /// The bucket capacity was zero.
    #[error("invalid capacity: capacity must be greater than zero (got {0})")]
    InvalidCapacity(u32),

    /// The refill rate was zero, negative or not finite.
    #[error("invalid rate: refill rate must be a finite number greater than zero (got {0})")]
    InvalidRate(f64),

    /// The client key could not be parsed as an IP address.
    #[error("invalid IP address: {0:?}")]
    InvalidKey(String),
}

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limiter construction or decision errors
    #[error("Rate limit error: {0}")]
    Limiter(#[from] LimiterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
