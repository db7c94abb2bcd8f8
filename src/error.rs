//! Error types for Burstgate.

use thiserror::Error;

/// Main error type for Burstgate operations.
///
/// A rate limit denial is not an error: `try_acquire` reports it as `Ok(false)`.
#[derive(Error, Debug)]
pub enum BurstgateError {
    /// A caller supplied an unusable argument (negative precharge, odd tier list, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Building a bucket produced unusable state
    #[error("Bucket construction failed: {0}")]
    Construction(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BurstgateError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        BurstgateError::InvalidArgument(msg.into())
    }
}

/// Result type alias for Burstgate operations.
pub type Result<T> = std::result::Result<T, BurstgateError>;
