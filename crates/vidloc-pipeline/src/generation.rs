//! Per-segment video generation
//!
//! Each segment clip is generated from its two edited boundary frames, then
//! conformed to the source frame rate and resolution and to exactly the
//! segment's frame count. Video models emit fixed clip lengths, so a clip
//! more than one frame interval off is re-timed onto the segment, or
//! rejected and regenerated when re-timing is off.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vidloc_artifacts::WorkDir;
use vidloc_core::{
    retry_with_backoff, AspectRatio, GeneratedSegment, MediaBackend, RetryOutcome, Segment, VideoInfo,
};
use vidloc_vision::prompts::build_motion_prompt;
use vidloc_vision::{GenerationProvider, VideoRequest};

use crate::config::GenerationConfig;
use crate::error::{GenerationAttemptError, SegmentGenerationError};
use crate::frame_edit::EditedBoundaries;

/// Generates and conforms segment clips
pub struct SegmentGenerator<'a, M, G> {
    media: &'a M,
    generation: &'a G,
    config: &'a GenerationConfig,
    source: &'a VideoInfo,
    work_dir: &'a WorkDir,
}

impl<'a, M, G> SegmentGenerator<'a, M, G>
where
    M: MediaBackend + Sync,
    G: GenerationProvider + Sync,
{
    pub fn new(
        media: &'a M,
        generation: &'a G,
        config: &'a GenerationConfig,
        source: &'a VideoInfo,
        work_dir: &'a WorkDir,
    ) -> Self {
        Self {
            media,
            generation,
            config,
            source,
            work_dir,
        }
    }

    /// Generate the clip for `segment` from its edited boundary frames
    pub async fn generate(
        &self,
        segment: &Segment,
        edited: &EditedBoundaries,
        cancel: &CancellationToken,
    ) -> Result<GeneratedSegment, SegmentGenerationError> {
        // Casting descriptions of everyone on either boundary, once each
        let casting: BTreeMap<&str, &str> = edited
            .start
            .identities
            .iter()
            .chain(edited.end.identities.iter())
            .map(|identity| (identity.person_id.as_str(), identity.casting_description.as_str()))
            .collect();
        let casting: Vec<String> = casting.values().map(|c| c.to_string()).collect();

        let request = VideoRequest {
            first_frame: edited.start.path.clone(),
            last_frame: edited.end.path.clone(),
            duration_secs: segment.duration(),
            prompt: build_motion_prompt(&casting, segment.duration()),
            aspect_ratio: AspectRatio::from_dimensions(self.source.width, self.source.height),
        };

        let operation = format!("Generation of segment {}", segment.index);
        let request = &request;
        let outcome = retry_with_backoff(
            &self.config.retry,
            &operation,
            cancel,
            GenerationAttemptError::is_retryable,
            move |attempt| async move {
                debug!("Generating segment {} (attempt {})", segment.index, attempt);
                self.attempt(segment, request).await
            },
        )
        .await;

        match outcome {
            RetryOutcome::Success { mut value, attempts } => {
                value.attempts = attempts;
                info!(
                    "Generated segment {} ({:.3}s, {} attempt(s))",
                    segment.index, value.duration, attempts
                );
                Ok(value)
            }
            RetryOutcome::Exhausted { error, attempts } | RetryOutcome::Rejected { error, attempts } => {
                Err(SegmentGenerationError::Failed {
                    segment: segment.index,
                    attempts,
                    source: error,
                })
            }
            RetryOutcome::Cancelled { .. } => Err(SegmentGenerationError::Cancelled),
        }
    }

    async fn attempt(
        &self,
        segment: &Segment,
        request: &VideoRequest,
    ) -> Result<GeneratedSegment, GenerationAttemptError> {
        let extension = self.media.clip_extension();
        let raw = self.work_dir.generated_clip(segment.index, extension);
        let conformed = self.work_dir.conformed_clip(segment.index, extension);

        let limit = self.config.call_timeout_secs;
        tokio::time::timeout(
            Duration::from_secs(limit),
            self.generation.generate_video(request, &raw),
        )
        .await
        .map_err(|_| GenerationAttemptError::Timeout(limit))??;

        let expected = segment.duration();
        let expected_frames = segment.frame_count();
        let tolerance = self.source.frame_interval();
        let raw_info = self.media.probe(&raw).await?;

        let close = (raw_info.duration() - expected).abs() <= tolerance;
        if !close && !(self.config.retime_to_segment && raw_info.frame_count > 0) {
            return Err(GenerationAttemptError::DurationMismatch {
                expected,
                actual: raw_info.duration(),
                tolerance,
            });
        }
        if !close {
            debug!(
                "Re-timing segment {} clip from {:.3}s to {:.3}s",
                segment.index,
                raw_info.duration(),
                expected
            );
        }

        // Stretched onto exactly the segment's frames
        let format = self.source.format().with_frames(expected_frames);
        self.media.conform(&raw, format, &conformed).await?;

        let info = self.media.probe(&conformed).await?;
        if info.frame_count != expected_frames {
            return Err(GenerationAttemptError::DurationMismatch {
                expected,
                actual: info.duration(),
                tolerance,
            });
        }

        Ok(GeneratedSegment {
            segment_index: segment.index,
            clip: conformed,
            duration: info.duration(),
            attempts: 0,
        })
    }
}
