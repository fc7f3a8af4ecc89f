//! Run configuration

use std::path::Path;

use serde::{Deserialize, Serialize};
use vidloc_core::{FailurePolicy, RetryPolicy, SegmentationPolicy, SegmenterConfig, TextLayerConfig};
use vidloc_identity::{CastingConfig, RegistryConfig};

use crate::error::PipelineError;

/// How captions are removed from boundary frames before editing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextRemovalMode {
    /// Image-edit collaborator removes the text
    #[default]
    Collaborator,
    /// Masked pixels are filled locally from their surroundings
    LocalInpaint,
}

/// Frame edit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameEditConfig {
    pub retry: RetryPolicy,
    /// Re-detect people on the edited frame and reject a count mismatch
    pub verify_person_count: bool,
    /// Restore source pixels outside the (padded) person regions
    pub confine_to_person_regions: bool,
    /// Padding around person regions in pixels
    pub region_padding: u32,
}

impl Default for FrameEditConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(3),
            verify_person_count: false,
            confine_to_person_regions: false,
            region_padding: 16,
        }
    }
}

/// Video generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub retry: RetryPolicy,
    /// Upper bound on one generation call, in seconds
    pub call_timeout_secs: u64,
    /// Stretch clips more than one frame off onto the segment instead of rejecting them
    pub retime_to_segment: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout_secs: 900,
            retime_to_segment: true,
        }
    }
}

/// Everything a run needs besides its inputs and collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub segmenter: SegmenterConfig,
    pub text_layer: TextLayerConfig,
    pub text_removal: TextRemovalMode,
    /// Retry budget for detection, persona portraits and text removal
    pub retry: RetryPolicy,
    pub registry: RegistryConfig,
    pub casting: CastingConfig,
    pub frame_edit: FrameEditConfig,
    pub generation: GenerationConfig,
    pub failure_policy: FailurePolicy,
    /// Segments edited and generated at once
    pub max_concurrent_segments: usize,
    /// Reuse completed steps from the artifact cache
    pub use_cache: bool,
    /// Copy the source audio onto the output
    pub keep_source_audio: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segmenter: SegmenterConfig::default(),
            text_layer: TextLayerConfig::default(),
            text_removal: TextRemovalMode::default(),
            retry: RetryPolicy::new(3),
            registry: RegistryConfig::default(),
            casting: CastingConfig::default(),
            frame_edit: FrameEditConfig::default(),
            generation: GenerationConfig::default(),
            failure_policy: FailurePolicy::default(),
            max_concurrent_segments: 4,
            use_cache: true,
            keep_source_audio: true,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Reject settings no run can succeed with
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_concurrent_segments == 0 {
            return Err(PipelineError::Config(
                "max_concurrent_segments must be at least 1".to_string(),
            ));
        }
        if self.casting.portraits_per_identity < 2 {
            return Err(PipelineError::Config(format!(
                "portraits_per_identity must be at least 2, got {}",
                self.casting.portraits_per_identity
            )));
        }
        if self.retry.max_attempts == 0
            || self.frame_edit.retry.max_attempts == 0
            || self.generation.retry.max_attempts == 0
        {
            return Err(PipelineError::Config("retry budgets must allow at least 1 attempt".to_string()));
        }
        if self.generation.call_timeout_secs == 0 {
            return Err(PipelineError::Config("call_timeout_secs must be positive".to_string()));
        }
        match &self.segmenter.policy {
            SegmentationPolicy::FixedInterval { interval_secs } if *interval_secs <= 0.0 => Err(
                PipelineError::Config(format!("interval must be positive, got {}", interval_secs)),
            ),
            SegmentationPolicy::ShotBoundary { max_segment_secs, .. } if *max_segment_secs <= 0.0 => Err(
                PipelineError::Config(format!("max_segment_secs must be positive, got {}", max_segment_secs)),
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.segmenter.policy, SegmentationPolicy::FixedInterval { interval_secs: 8.0 });
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.max_concurrent_segments, 4);
        assert_eq!(config.frame_edit.retry.max_attempts, 3);
        assert_eq!(config.generation.retry.max_attempts, 4);
        assert_eq!(config.generation.retry.base_delay_ms, 2_000);
        assert_eq!(config.generation.retry.max_delay_ms, 60_000);
        assert_eq!(config.casting.portraits_per_identity, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "failure_policy": "substitute_original",
                "segmenter": {"policy": {"mode": "fixed_interval", "interval_secs": 5.0}},
                "generation": {"retry": {"max_attempts": 2}}
            }"#,
        )
        .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::SubstituteOriginal);
        assert_eq!(config.segmenter.policy, SegmentationPolicy::FixedInterval { interval_secs: 5.0 });
        assert_eq!(config.segmenter.min_segment_frames, 2);
        assert_eq!(config.generation.retry.max_attempts, 2);
        assert_eq!(config.generation.retry.base_delay_ms, 2_000);
        assert_eq!(config.max_concurrent_segments, 4);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let config = PipelineConfig {
            max_concurrent_segments: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        let mut config = PipelineConfig::default();
        config.casting.portraits_per_identity = 1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.segmenter.policy = SegmentationPolicy::FixedInterval { interval_secs: 0.0 };
        assert!(config.validate().is_err());
    }
}
