//! Run orchestration for vidloc
//!
//! Ties the media backend, the person registry, the identity set and the
//! collaborators into a single run: segment, preserve the text layer,
//! replace people at every segment boundary, regenerate each segment and
//! reassemble the timeline.

mod cached;
pub mod config;
pub mod error;
pub mod frame_edit;
pub mod generation;
pub mod orchestrator;

#[cfg(test)]
mod test_support;

pub use config::{FrameEditConfig, GenerationConfig, PipelineConfig, TextRemovalMode};
pub use error::{EditAttemptError, FrameEditError, GenerationAttemptError, PipelineError, SegmentGenerationError};
pub use frame_edit::{EditedBoundaries, FrameEditor};
pub use generation::SegmentGenerator;
pub use orchestrator::{Pipeline, RunRequest};
