//! Artifact error types

use thiserror::Error;

/// Step cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Cache directory could not be determined
    #[error("Failed to access cache directory: {0}")]
    CacheDirectoryError(String),

    /// Source file is missing
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// Artifact could not be serialized
    #[error("Failed to serialize artifact: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Download errors
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Request failed before a response arrived
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Server answered with an error status
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// `data:` URI could not be decoded
    #[error("Invalid data URI: {0}")]
    InvalidDataUri(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::DownloadFailed(err.to_string())
    }
}
