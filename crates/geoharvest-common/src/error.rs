//! Error types shared across geoharvest crates

use thiserror::Error;

/// Result type alias for shared utilities
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Atomic replace of {path} failed: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid quality label: {0}")]
    InvalidQuality(String),

    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),
}
