//! Error types for the aggregate execution framework

use thiserror::Error;

/// Result type alias for aggregate framework operations
pub type Result<T> = std::result::Result<T, AggError>;

/// Main error type for the aggregate framework.
///
/// Every fail signal propagates unmodified to the query executor; the
/// framework itself neither logs nor retries.
#[derive(Error, Debug)]
pub enum AggError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}
