//! Pipeline error types

use std::path::PathBuf;

use thiserror::Error;
use vidloc_artifacts::CacheError;
use vidloc_core::{Boundary, MediaError};
use vidloc_vision::CollaboratorError;

/// Errors that stop a run before it can produce a report
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration is unusable
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Source video is missing
    #[error("Source not found: {0}")]
    SourceNotFound(PathBuf),

    /// Step cache failure
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single frame edit attempt
#[derive(Error, Debug)]
pub enum EditAttemptError {
    /// Collaborator call failed
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// Edited frame does not match the source frame
    #[error("Edited frame rejected: {0}")]
    Inconsistent(String),

    /// Media error while checking the result
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

impl EditAttemptError {
    /// Collaborator errors defer to the collaborator; a rejected result is worth another try
    pub fn is_retryable(&self) -> bool {
        match self {
            EditAttemptError::Collaborator(e) => e.is_retryable(),
            EditAttemptError::Inconsistent(_) => true,
            EditAttemptError::Media(_) => false,
        }
    }
}

/// Frame edit errors
#[derive(Error, Debug)]
pub enum FrameEditError {
    /// Retries exhausted or a permanent failure
    #[error("Edit of segment {segment} {boundary} frame failed after {attempts} attempt(s): {source}")]
    Failed {
        segment: usize,
        boundary: Boundary,
        attempts: u32,
        #[source]
        source: EditAttemptError,
    },

    /// A visible person has no identity reference
    #[error("No identity reference for {0}")]
    MissingIdentity(String),

    /// Run was cancelled
    #[error("Frame edit cancelled")]
    Cancelled,

    /// Media error
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameEditError {
    /// Collaborator attempts spent
    pub fn attempts(&self) -> u32 {
        match self {
            FrameEditError::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

/// Failure of a single video generation attempt
#[derive(Error, Debug)]
pub enum GenerationAttemptError {
    /// Collaborator call failed
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// Clip length is off even after re-timing
    #[error("Generated clip lasts {actual:.3}s, expected {expected:.3}s (tolerance {tolerance:.3}s)")]
    DurationMismatch {
        expected: f64,
        actual: f64,
        tolerance: f64,
    },

    /// Generated clip could not be read or conformed
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Call exceeded the per-call time limit
    #[error("Video generation timed out after {0}s")]
    Timeout(u64),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GenerationAttemptError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationAttemptError::Collaborator(e) => e.is_retryable(),
            GenerationAttemptError::DurationMismatch { .. }
            | GenerationAttemptError::Media(_)
            | GenerationAttemptError::Timeout(_) => true,
            GenerationAttemptError::Io(_) => false,
        }
    }
}

/// Segment generation errors
#[derive(Error, Debug)]
pub enum SegmentGenerationError {
    /// Retries exhausted or a permanent failure
    #[error("Generation of segment {segment} failed after {attempts} attempt(s): {source}")]
    Failed {
        segment: usize,
        attempts: u32,
        #[source]
        source: GenerationAttemptError,
    },

    /// Run was cancelled
    #[error("Video generation cancelled")]
    Cancelled,
}

impl SegmentGenerationError {
    pub fn attempts(&self) -> u32 {
        match self {
            SegmentGenerationError::Failed { attempts, .. } => *attempts,
            SegmentGenerationError::Cancelled => 0,
        }
    }
}
