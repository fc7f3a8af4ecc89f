//! Collaborator traits and request types

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vidloc_core::{AspectRatio, DetectedPerson, PersonRecord, Persona, TransformationTheme};

use crate::error::CollaboratorError;

/// Text-to-image request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
}

/// Image edit request: one frame plus the reference images it must follow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRequest {
    /// Image being edited
    pub image: PathBuf,
    /// Reference images, in the order the instruction refers to them
    pub references: Vec<PathBuf>,
    /// Edit instruction
    pub instruction: String,
    pub aspect_ratio: AspectRatio,
}

/// First/last frame conditioned video request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRequest {
    pub first_frame: PathBuf,
    pub last_frame: PathBuf,
    /// Target clip duration in seconds
    pub duration_secs: f64,
    /// Motion prompt
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
}

impl VideoRequest {
    /// Duration in whole seconds as accepted by video models, at least 1
    pub fn duration_whole_secs(&self) -> u32 {
        self.duration_secs.round().max(1.0) as u32
    }
}

/// Person detection and persona design
#[trait_variant::make(PerceptionProvider: Send)]
pub trait LocalPerceptionProvider {
    /// Detect every person in an image, with pixel regions and appearance
    async fn detect_people(&self, image: &Path) -> Result<Vec<DetectedPerson>, CollaboratorError>;

    /// Design one replacement persona per original person, in the same order
    async fn design_personas(
        &self,
        originals: &[PersonRecord],
        theme: &TransformationTheme,
    ) -> Result<Vec<Persona>, CollaboratorError>;

    /// Check if provider is available
    async fn is_available(&self) -> bool;

    /// Get provider name
    fn name(&self) -> &'static str;

    /// Get model name
    fn model(&self) -> &str;
}

/// Image and video generation
///
/// Every operation writes its result to `output` and returns that path.
#[trait_variant::make(GenerationProvider: Send)]
pub trait LocalGenerationProvider {
    /// Generate an image from a text prompt
    async fn generate_image(&self, request: &ImageRequest, output: &Path) -> Result<PathBuf, CollaboratorError>;

    /// Edit an image guided by reference images
    async fn edit_image(&self, request: &EditRequest, output: &Path) -> Result<PathBuf, CollaboratorError>;

    /// Generate a clip that starts and ends on the given frames
    async fn generate_video(&self, request: &VideoRequest, output: &Path) -> Result<PathBuf, CollaboratorError>;

    /// Remove captions and overlaid text from a frame
    async fn remove_text(&self, image: &Path, output: &Path) -> Result<PathBuf, CollaboratorError>;

    /// Get provider name
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_video_request(duration_secs: f64) -> VideoRequest {
        VideoRequest {
            first_frame: PathBuf::from("start.png"),
            last_frame: PathBuf::from("end.png"),
            duration_secs,
            prompt: String::new(),
            aspect_ratio: AspectRatio::Portrait9x16,
        }
    }

    #[test]
    fn test_duration_whole_secs() {
        assert_eq!(create_test_video_request(7.6).duration_whole_secs(), 8);
        assert_eq!(create_test_video_request(5.0).duration_whole_secs(), 5);
        assert_eq!(create_test_video_request(0.2).duration_whole_secs(), 1);
    }
}
