//! Identity error types

use std::path::PathBuf;

use thiserror::Error;
use vidloc_vision::CollaboratorError;

/// Person registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No person in any sampled frame
    #[error("No person detected in {frames} sampled frame(s)")]
    NoPersonDetected { frames: usize },

    /// Detection kept failing for a frame
    #[error("Person detection failed for {frame} after {attempts} attempt(s): {source}")]
    DetectionFailed {
        frame: PathBuf,
        attempts: u32,
        #[source]
        source: CollaboratorError,
    },

    /// Frame could not be read
    #[error("Failed to read frame: {0}")]
    ImageError(#[from] image::ImageError),

    /// Run was cancelled
    #[error("Person detection cancelled")]
    Cancelled,
}

/// Identity reference errors
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Fewer than two portraits cannot anchor an identity
    #[error("At least 2 portraits per identity are required, got {0}")]
    InvalidPortraitCount(usize),

    /// Persona design kept failing
    #[error("Persona design failed after {attempts} attempt(s): {source}")]
    PersonaDesignFailed {
        attempts: u32,
        #[source]
        source: CollaboratorError,
    },

    /// A reference portrait could not be generated
    #[error("Portrait {number} for {person_id} failed after {attempts} attempt(s): {source}")]
    PortraitFailed {
        person_id: String,
        number: usize,
        attempts: u32,
        #[source]
        source: CollaboratorError,
    },

    /// Run was cancelled
    #[error("Identity generation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
