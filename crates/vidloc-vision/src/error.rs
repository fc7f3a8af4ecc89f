//! Collaborator error types

use thiserror::Error;
use vidloc_artifacts::DownloadError;

/// Errors from perception and generation collaborators
#[derive(Error, Debug)]
pub enum CollaboratorError {
    /// API key not configured
    #[error("API key not configured for {0}")]
    ApiKeyMissing(String),

    /// Request was rejected by the service
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Service answered with a server-side error
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// Response body was not what the API documents
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limited, retry after the given number of seconds
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Model output could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Request or job timed out
    #[error("Request timed out")]
    Timeout,

    /// Queued job finished without a result
    #[error("Job failed: {0}")]
    JobFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Result file could not be fetched
    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    /// Local image could not be read
    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CollaboratorError {
    /// Whether repeating the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            CollaboratorError::ApiKeyMissing(_)
            | CollaboratorError::ConfigError(_)
            | CollaboratorError::ImageError(_)
            | CollaboratorError::IoError(_) => false,
            CollaboratorError::RequestFailed(_) => false,
            CollaboratorError::Download(DownloadError::InvalidDataUri(_)) => false,
            CollaboratorError::Download(DownloadError::HttpStatus { status, .. }) => {
                *status >= 500 || *status == 429
            }
            _ => true,
        }
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CollaboratorError::Timeout
        } else if err.is_connect() {
            CollaboratorError::ConnectionError(err.to_string())
        } else {
            CollaboratorError::RequestFailed(err.to_string())
        }
    }
}
