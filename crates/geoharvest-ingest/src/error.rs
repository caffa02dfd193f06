//! Error types for the harvest pipeline
//!
//! Per-item failures (missing URL, failed conversion) are not errors here;
//! they are reported through [`crate::worker::ItemOutcome`] so that one bad
//! item never aborts a harvest.

use geoharvest_common::CommonError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Retry budget exhausted for a single request
    #[error("Request to {url} failed after {attempts} attempts: {source}")]
    TransientNetwork {
        url: String,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Resume cursor is not an absolute http(s) URL
    #[error("Invalid resume cursor '{0}': expected an absolute http(s) URL")]
    InvalidCursor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Response body did not have the expected shape
    #[error("Failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Archive error for {path}: {reason}")]
    Archive { path: String, reason: String },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        IngestError::Config(msg.into())
    }

    pub fn archive(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        IngestError::Archive {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Errors that retrying cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::InvalidCursor(_) | IngestError::Config(_))
    }
}
