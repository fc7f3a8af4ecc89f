//! Run orchestration
//!
//! Everything up to and including the identity references is a barrier:
//! segmentation, text layer extraction, text removal, the person registry
//! and the identity set are complete before the first segment is edited.
//! Segments are then edited and generated concurrently, at most
//! `max_concurrent_segments` at a time, and reassembled in source order.
//! A segment that exhausts its retries is handled by the failure policy.

use std::path::{Path, PathBuf};

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use image::imageops::FilterType;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vidloc_artifacts::{params_digest, steps, Artifact, ArtifactCache, SourceFingerprint, WorkDir};
use vidloc_core::media::{load_rgba, save_png};
use vidloc_core::{
    extract_text_layer, inpaint, retry_with_backoff, Boundary, ClipOrigin, FailurePolicy, GeneratedSegment,
    MediaBackend, MediaError, PassthroughReason, Reassembler, RetryOutcome, RunOutcome, RunReport, RunStage,
    Segment, SegmentFailure, SegmentReport, SegmentStage, SegmentStatus, Segmenter, TextLayer, TextLayerMode,
    TextReintegrator, TimelineEntry, TransformationTheme, VideoInfo,
};
use vidloc_identity::{
    IdentityError, IdentityGenerator, IdentitySet, PersonRegistry, RegistryBuilder, RegistryError, SampledFrame,
};
use vidloc_vision::{CollaboratorError, GenerationProvider, PerceptionProvider};

use crate::cached::{CleanedFrames, CleanedPair, SavedTextLayer, SegmentPlan, SegmentResult};
use crate::config::{PipelineConfig, TextRemovalMode};
use crate::error::{FrameEditError, PipelineError, SegmentGenerationError};
use crate::frame_edit::FrameEditor;
use crate::generation::SegmentGenerator;

/// Inputs of one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: PathBuf,
    pub output: PathBuf,
    pub theme: TransformationTheme,
    /// Directory for intermediate artifacts
    pub work_dir: PathBuf,
}

/// Why a run stopped early
enum StageFailure {
    Failed { stage: RunStage, message: String },
    Cancelled,
}

fn failed_at<E: std::fmt::Display>(stage: RunStage) -> impl FnOnce(E) -> StageFailure {
    move |e| StageFailure::Failed {
        stage,
        message: e.to_string(),
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), StageFailure> {
    if cancel.is_cancelled() {
        Err(StageFailure::Cancelled)
    } else {
        Ok(())
    }
}

/// Cache key for a parameter set; an unserializable set gets an empty key
fn digest<T: Serialize>(params: &T) -> String {
    params_digest(params).unwrap_or_default()
}

/// Report fields filled in as the run advances
struct Progress {
    source_duration: f64,
    text_layer: TextLayerMode,
    person_count: usize,
    segments: Vec<SegmentReport>,
}

/// Shared, read-only state of the segment phase
struct SegmentContext<'a> {
    source: &'a VideoInfo,
    work_dir: &'a WorkDir,
    cleaned: &'a CleanedFrames,
    registry: &'a PersonRegistry,
    identities: &'a IdentitySet,
    fingerprint: Option<&'a SourceFingerprint>,
    key: &'a str,
}

/// Video localization pipeline
pub struct Pipeline<M, P, G> {
    media: M,
    perception: P,
    generation: G,
    config: PipelineConfig,
    cache: ArtifactCache,
}

impl<M, P, G> Pipeline<M, P, G>
where
    M: MediaBackend + Sync,
    P: PerceptionProvider + Sync,
    G: GenerationProvider + Sync,
{
    /// Create a pipeline; the step cache lives in the user cache directory unless disabled
    pub fn new(media: M, perception: P, generation: G, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let cache = if config.use_cache {
            ArtifactCache::new()
        } else {
            ArtifactCache::disabled()
        };

        Ok(Self {
            media,
            perception,
            generation,
            config,
            cache,
        })
    }

    /// Use a custom step cache
    pub fn with_cache(mut self, cache: ArtifactCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn perception(&self) -> &P {
        &self.perception
    }

    pub fn generation(&self) -> &G {
        &self.generation
    }

    /// Localize `request.source` and describe the outcome
    ///
    /// Stage failures and cancellation are reported in the returned
    /// [`RunReport`]; `Err` means the run could not start.
    pub async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<RunReport, PipelineError> {
        if !request.source.exists() {
            return Err(PipelineError::SourceNotFound(request.source.clone()));
        }
        let work_dir = WorkDir::create(request.work_dir.clone()).await?;

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(
            "Run {} started: {} -> {} (theme '{}')",
            run_id,
            request.source.display(),
            request.output.display(),
            request.theme
        );

        let mut progress = Progress {
            source_duration: 0.0,
            text_layer: TextLayerMode::NotAttempted,
            person_count: 0,
            segments: Vec::new(),
        };

        let outcome = match self.execute(request, &work_dir, cancel, &mut progress).await {
            Ok(outcome) => outcome,
            Err(StageFailure::Cancelled) => {
                warn!("Run {} cancelled", run_id);
                RunOutcome::Cancelled
            }
            Err(StageFailure::Failed { stage, message }) => {
                error!("Run {} failed at {}: {}", run_id, stage, message);
                RunOutcome::Failed { stage, message }
            }
        };

        let finished_at = Utc::now();
        if let RunOutcome::Completed { output } = &outcome {
            info!(
                "Run {} completed in {:.1}s: {} generated, {} substituted, output {}",
                run_id,
                (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
                progress.segments.iter().filter(|s| s.status == SegmentStatus::Generated).count(),
                progress.segments.iter().filter(|s| s.status == SegmentStatus::Substituted).count(),
                output.display()
            );
        }

        Ok(RunReport {
            run_id,
            source: request.source.clone(),
            theme: request.theme.clone(),
            started_at,
            finished_at,
            source_duration: progress.source_duration,
            outcome,
            text_layer: progress.text_layer,
            person_count: progress.person_count,
            segments: progress.segments,
        })
    }

    async fn execute(
        &self,
        request: &RunRequest,
        work_dir: &WorkDir,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<RunOutcome, StageFailure> {
        let info = self
            .media
            .probe(&request.source)
            .await
            .map_err(failed_at(RunStage::Probe))?;
        progress.source_duration = info.duration();

        let fingerprint = match SourceFingerprint::of(&request.source).await {
            Ok(fingerprint) => Some(fingerprint),
            Err(e) => {
                warn!("Step cache unavailable for this run: {}", e);
                None
            }
        };
        let fingerprint = fingerprint.as_ref();
        checkpoint(cancel)?;

        // Segmentation
        let segments_key = digest(&self.config.segmenter);
        let segments = self
            .segment(&request.source, work_dir, fingerprint, &segments_key)
            .await?;
        checkpoint(cancel)?;

        // Text layer
        let layer_key = digest(&self.config.text_layer);
        let layer = self.text_layer(&info, work_dir, fingerprint, &layer_key).await;
        progress.text_layer = match &layer {
            Ok(layer) => TextLayerMode::Present {
                region: layer.region(),
                pixel_count: layer.pixel_count(),
            },
            Err(reason) => TextLayerMode::Absent { reason: reason.clone() },
        };
        let layer = layer.ok();
        checkpoint(cancel)?;

        // Text removal
        let cleaned_key = digest(&(
            &segments_key,
            &layer_key,
            self.config.text_removal,
            layer.is_some(),
        ));
        let cleaned = self
            .clean_frames(&segments, layer.as_ref(), work_dir, fingerprint, &cleaned_key, cancel)
            .await?;
        checkpoint(cancel)?;

        // Person registry
        let registry_key = digest(&(&cleaned_key, &self.config.registry));
        let registry = match self
            .person_registry(&segments, &cleaned, fingerprint, &registry_key, cancel)
            .await?
        {
            Some(registry) => registry,
            None => {
                self.copy_to_output(&request.source, &request.output).await?;
                info!(
                    "No person in {}, returned it unmodified",
                    request.source.display()
                );
                return Ok(RunOutcome::Passthrough {
                    reason: PassthroughReason::NoPersonDetected,
                    output: request.output.clone(),
                });
            }
        };
        progress.person_count = registry.len();
        checkpoint(cancel)?;

        // Identity references
        let identities_key = digest(&(&registry_key, &request.theme, &self.config.casting));
        let identities = self
            .identity_set(&registry, &request.theme, work_dir, fingerprint, &identities_key, cancel)
            .await?;
        checkpoint(cancel)?;

        // Segments
        let segment_key = digest(&(
            &identities_key,
            &self.config.frame_edit,
            &self.config.generation,
        ));
        let context = SegmentContext {
            source: &info,
            work_dir,
            cleaned: &cleaned,
            registry: &registry,
            identities: &identities,
            fingerprint,
            key: &segment_key,
        };
        // Aborting stops the segment phase only; the caller's token stays untouched
        let segment_cancel = cancel.child_token();
        progress.segments = self.process_segments(&context, &segments, &segment_cancel).await;
        checkpoint(cancel)?;

        let failed = progress
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Failed)
            .min_by_key(|s| {
                let cancelled = matches!(&s.failure, Some(f) if f.stage == SegmentStage::Cancelled);
                (cancelled, s.index)
            });
        if let Some(report) = failed {
            let message = match &report.failure {
                Some(failure) => format!(
                    "segment {} failed at {}: {}",
                    report.index, failure.stage, failure.message
                ),
                None => format!("segment {} failed", report.index),
            };
            return Err(StageFailure::Failed {
                stage: RunStage::SegmentProcessing,
                message,
            });
        }

        // Reassembly
        let extension = self.media.clip_extension();
        let mut entries = Vec::with_capacity(segments.len());
        for (segment, report) in segments.iter().zip(&progress.segments) {
            let clip = report.clip.clone().ok_or_else(|| StageFailure::Failed {
                stage: RunStage::Reassembly,
                message: format!("segment {} has no clip", segment.index),
            })?;
            entries.push(TimelineEntry {
                index: segment.index,
                clip,
                expected: segment.span,
                origin: match report.status {
                    SegmentStatus::Substituted => ClipOrigin::Original,
                    _ => ClipOrigin::Generated,
                },
            });
        }
        let timeline = Reassembler::new(&self.media, info.clone())
            .reassemble(&entries, &work_dir.timeline(extension))
            .await
            .map_err(failed_at(RunStage::Reassembly))?;
        checkpoint(cancel)?;

        // Text reintegration
        let composited = match &layer {
            Some(layer) => TextReintegrator::new(&self.media, info.clone())
                .reintegrate(
                    &timeline.path,
                    layer,
                    &work_dir.timeline_frames_dir(),
                    &work_dir.composited(extension),
                )
                .await
                .map_err(failed_at(RunStage::TextReintegration))?,
            None => timeline.path.clone(),
        };

        // Output
        if self.config.keep_source_audio && info.has_audio {
            if let Some(parent) = request.output.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(failed_at(RunStage::Output))?;
            }
            self.media
                .mux_audio(&composited, &request.source, &request.output)
                .await
                .map_err(failed_at(RunStage::Output))?;
        } else {
            self.copy_to_output(&composited, &request.output).await?;
        }

        Ok(RunOutcome::Completed {
            output: request.output.clone(),
        })
    }

    async fn load_cached<A: Artifact>(
        &self,
        fingerprint: Option<&SourceFingerprint>,
        step: &str,
        key: &str,
    ) -> Option<A> {
        let fingerprint = fingerprint?;
        match self.cache.load(fingerprint, step, key).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("Ignoring {} cache entry: {}", step, e);
                None
            }
        }
    }

    async fn store_cached<A: Artifact>(
        &self,
        fingerprint: Option<&SourceFingerprint>,
        step: &str,
        key: &str,
        artifact: &A,
    ) {
        if let Some(fingerprint) = fingerprint {
            if let Err(e) = self.cache.save(fingerprint, step, key, artifact).await {
                warn!("Failed to cache {}: {}", step, e);
            }
        }
    }

    async fn segment(
        &self,
        source: &Path,
        work_dir: &WorkDir,
        fingerprint: Option<&SourceFingerprint>,
        key: &str,
    ) -> Result<Vec<Segment>, StageFailure> {
        if let Some(SegmentPlan(segments)) = self.load_cached(fingerprint, steps::SEGMENTS, key).await {
            info!("Loaded {} segments from cache", segments.len());
            return Ok(segments);
        }

        let segments = Segmenter::new(self.config.segmenter.clone())
            .segment(&self.media, source, &work_dir.frames_dir())
            .await
            .map_err(failed_at(RunStage::Segmentation))?;

        let plan = SegmentPlan(segments);
        self.store_cached(fingerprint, steps::SEGMENTS, key, &plan).await;
        Ok(plan.0)
    }

    /// Extract the text layer, or the reason there is none
    async fn text_layer(
        &self,
        info: &VideoInfo,
        work_dir: &WorkDir,
        fingerprint: Option<&SourceFingerprint>,
        key: &str,
    ) -> Result<TextLayer, String> {
        if let Some(saved) = self
            .load_cached::<SavedTextLayer>(fingerprint, steps::TEXT_LAYER, key)
            .await
        {
            match TextLayer::load(&saved.path, saved.active).await {
                Ok(layer) => {
                    info!("Loaded text layer from cache");
                    return Ok(layer);
                }
                Err(e) => warn!("Cached text layer unusable: {}", e),
            }
        }

        let layer = match extract_text_layer(&self.media, info, &self.config.text_layer).await {
            Ok(layer) => layer,
            Err(e) => {
                info!("No text layer to preserve: {}", e);
                return Err(e.to_string());
            }
        };

        let path = work_dir.text_layer();
        match layer.save(&path).await {
            Ok(()) => {
                let saved = SavedTextLayer {
                    path,
                    active: layer.active(),
                };
                self.store_cached(fingerprint, steps::TEXT_LAYER, key, &saved).await;
            }
            Err(e) => warn!("Failed to save text layer: {}", e),
        }
        Ok(layer)
    }

    async fn clean_frames(
        &self,
        segments: &[Segment],
        layer: Option<&TextLayer>,
        work_dir: &WorkDir,
        fingerprint: Option<&SourceFingerprint>,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<CleanedFrames, StageFailure> {
        if let Some(cleaned) = self
            .load_cached::<CleanedFrames>(fingerprint, steps::CLEANED_FRAMES, key)
            .await
        {
            if cleaned.len() == segments.len() {
                info!("Loaded {} text-removed frame pairs from cache", cleaned.len());
                return Ok(cleaned);
            }
        }

        let mut jobs = Vec::with_capacity(segments.len() * 2);
        for segment in segments {
            for boundary in Boundary::ALL {
                jobs.push((
                    segment.boundary(boundary).path.clone(),
                    work_dir.cleaned_frame(segment.index, boundary),
                ));
            }
        }

        if layer.is_some() {
            info!(
                "Removing text from {} boundary frames ({:?})",
                jobs.len(),
                self.config.text_removal
            );
        }

        stream::iter(&jobs)
            .map(|(source, output)| self.clean_frame(source, output, layer, cancel))
            .buffer_unordered(self.config.max_concurrent_segments)
            .try_collect::<Vec<()>>()
            .await?;

        let cleaned = CleanedFrames(
            segments
                .iter()
                .map(|segment| CleanedPair {
                    start: work_dir.cleaned_frame(segment.index, Boundary::Start),
                    end: work_dir.cleaned_frame(segment.index, Boundary::End),
                })
                .collect(),
        );
        self.store_cached(fingerprint, steps::CLEANED_FRAMES, key, &cleaned).await;
        Ok(cleaned)
    }

    async fn clean_frame(
        &self,
        source: &Path,
        output: &Path,
        layer: Option<&TextLayer>,
        cancel: &CancellationToken,
    ) -> Result<(), StageFailure> {
        let layer = match layer {
            Some(layer) => layer,
            None => {
                tokio::fs::copy(source, output)
                    .await
                    .map_err(failed_at(RunStage::TextRemoval))?;
                return Ok(());
            }
        };

        match self.config.text_removal {
            TextRemovalMode::LocalInpaint => {
                let frame = load_rgba(source).await.map_err(failed_at(RunStage::TextRemoval))?;
                let layer = layer.clone();
                let cleaned = tokio::task::spawn_blocking(move || inpaint(&frame, &layer))
                    .await
                    .map_err(failed_at(RunStage::TextRemoval))?
                    .map_err(failed_at(RunStage::TextRemoval))?;
                save_png(cleaned, output)
                    .await
                    .map_err(failed_at(RunStage::TextRemoval))?;
            }
            TextRemovalMode::Collaborator => {
                let operation = format!("Text removal of {}", source.display());
                let generation = &self.generation;
                let outcome = retry_with_backoff(
                    &self.config.retry,
                    &operation,
                    cancel,
                    CollaboratorError::is_retryable,
                    move |_| generation.remove_text(source, output),
                )
                .await;

                match outcome {
                    RetryOutcome::Success { .. } => {}
                    RetryOutcome::Exhausted { error, attempts } | RetryOutcome::Rejected { error, attempts } => {
                        return Err(StageFailure::Failed {
                            stage: RunStage::TextRemoval,
                            message: format!("{} failed after {} attempt(s): {}", operation, attempts, error),
                        });
                    }
                    RetryOutcome::Cancelled { .. } => return Err(StageFailure::Cancelled),
                }

                let (width, height) = image::image_dimensions(source).map_err(failed_at(RunStage::TextRemoval))?;
                match_dimensions(output, width, height)
                    .await
                    .map_err(failed_at(RunStage::TextRemoval))?;
            }
        }
        Ok(())
    }

    /// Build the registry; `None` when nobody appears in the video
    async fn person_registry(
        &self,
        segments: &[Segment],
        cleaned: &CleanedFrames,
        fingerprint: Option<&SourceFingerprint>,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PersonRegistry>, StageFailure> {
        if let Some(registry) = self
            .load_cached::<PersonRegistry>(fingerprint, steps::REGISTRY, key)
            .await
        {
            if !registry.is_empty() {
                info!("Loaded {} registered people from cache", registry.len());
                return Ok(Some(registry));
            }
        }

        let mut frames = Vec::with_capacity(segments.len() * 2);
        for segment in segments {
            let pair = cleaned.get(segment.index).ok_or_else(|| StageFailure::Failed {
                stage: RunStage::PersonRegistry,
                message: format!("no text-removed frames for segment {}", segment.index),
            })?;
            for boundary in Boundary::ALL {
                frames.push(SampledFrame {
                    segment_index: segment.index,
                    boundary,
                    frame_index: segment.boundary(boundary).frame_index,
                    path: pair.get(boundary).to_path_buf(),
                });
            }
        }

        let builder = RegistryBuilder::new(self.config.registry.clone());
        match builder
            .build(&self.perception, &frames, &self.config.retry, cancel)
            .await
        {
            Ok(registry) => {
                info!("Registered {} people", registry.len());
                self.store_cached(fingerprint, steps::REGISTRY, key, &registry).await;
                Ok(Some(registry))
            }
            Err(RegistryError::NoPersonDetected { frames }) => {
                info!("No person detected in {} boundary frames", frames);
                Ok(None)
            }
            Err(RegistryError::Cancelled) => Err(StageFailure::Cancelled),
            Err(e) => Err(failed_at(RunStage::PersonRegistry)(e)),
        }
    }

    async fn identity_set(
        &self,
        registry: &PersonRegistry,
        theme: &TransformationTheme,
        work_dir: &WorkDir,
        fingerprint: Option<&SourceFingerprint>,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentitySet, StageFailure> {
        if let Some(identities) = self
            .load_cached::<IdentitySet>(fingerprint, steps::IDENTITIES, key)
            .await
        {
            if identities.len() == registry.len() {
                info!("Loaded {} identities from cache", identities.len());
                return Ok(identities);
            }
        }

        let generator =
            IdentityGenerator::new(self.config.casting.clone()).map_err(failed_at(RunStage::IdentityReferences))?;
        match generator
            .generate(
                &self.perception,
                &self.generation,
                registry,
                theme,
                work_dir,
                &self.config.retry,
                cancel,
            )
            .await
        {
            Ok(identities) => {
                self.store_cached(fingerprint, steps::IDENTITIES, key, &identities).await;
                Ok(identities)
            }
            Err(IdentityError::Cancelled) => Err(StageFailure::Cancelled),
            Err(e) => Err(failed_at(RunStage::IdentityReferences)(e)),
        }
    }

    /// Edit and generate every segment; reports come back in segment order
    async fn process_segments(
        &self,
        context: &SegmentContext<'_>,
        segments: &[Segment],
        cancel: &CancellationToken,
    ) -> Vec<SegmentReport> {
        info!(
            "Processing {} segments, {} at a time",
            segments.len(),
            self.config.max_concurrent_segments
        );

        let mut reports: Vec<SegmentReport> = stream::iter(segments)
            .map(|segment| self.process_segment(context, segment, cancel))
            .buffer_unordered(self.config.max_concurrent_segments)
            .collect()
            .await;
        reports.sort_by_key(|r| r.index);
        reports
    }

    async fn process_segment(
        &self,
        context: &SegmentContext<'_>,
        segment: &Segment,
        cancel: &CancellationToken,
    ) -> SegmentReport {
        let mut report = SegmentReport {
            index: segment.index,
            start_time: segment.start_time(),
            end_time: segment.end_time(),
            status: SegmentStatus::Failed,
            attempts: 0,
            fallback: None,
            failure: None,
            clip: None,
        };

        if cancel.is_cancelled() {
            report.failure = Some(SegmentFailure {
                stage: SegmentStage::Cancelled,
                message: "run stopped before the segment started".to_string(),
                attempts: 0,
            });
            return report;
        }

        let key = digest(&(context.key, segment.index));
        if let Some(SegmentResult(generated)) = self
            .load_cached(context.fingerprint, steps::SEGMENT_RESULT, &key)
            .await
        {
            info!("Segment {} loaded from cache", segment.index);
            report.status = SegmentStatus::Generated;
            report.attempts = generated.attempts;
            report.clip = Some(generated.clip);
            return report;
        }

        let failure = match self.edit_and_generate(context, segment, cancel).await {
            Ok((generated, edit_attempts)) => {
                self.store_cached(
                    context.fingerprint,
                    steps::SEGMENT_RESULT,
                    &key,
                    &SegmentResult(generated.clone()),
                )
                .await;
                report.status = SegmentStatus::Generated;
                report.attempts = edit_attempts + generated.attempts;
                report.clip = Some(generated.clip);
                return report;
            }
            Err(failure) => failure,
        };

        report.attempts = failure.attempts;
        if failure.stage == SegmentStage::Cancelled {
            debug!("Segment {} stopped by cancellation", segment.index);
            report.failure = Some(failure);
            return report;
        }

        warn!(
            "Segment {} failed at {} after {} attempt(s): {}",
            segment.index, failure.stage, failure.attempts, failure.message
        );
        report.fallback = Some(self.config.failure_policy);

        match self.config.failure_policy {
            FailurePolicy::Abort => {
                cancel.cancel();
                report.failure = Some(failure);
            }
            FailurePolicy::SubstituteOriginal => {
                let clip = context
                    .work_dir
                    .source_clip(segment.index, self.media.clip_extension());
                match self.media.cut(&context.source.path, segment.span, &clip).await {
                    Ok(()) => {
                        info!("Substituted the original clip for segment {}", segment.index);
                        report.status = SegmentStatus::Substituted;
                        report.clip = Some(clip);
                        report.failure = Some(failure);
                    }
                    Err(e) => {
                        error!("Could not cut the original clip for segment {}: {}", segment.index, e);
                        report.failure = Some(SegmentFailure {
                            stage: SegmentStage::Substitution,
                            message: format!("{}; substitution failed: {}", failure.message, e),
                            attempts: failure.attempts,
                        });
                    }
                }
            }
        }
        report
    }

    /// Returns the generated segment and the frame edit attempts spent on it
    async fn edit_and_generate(
        &self,
        context: &SegmentContext<'_>,
        segment: &Segment,
        cancel: &CancellationToken,
    ) -> Result<(GeneratedSegment, u32), SegmentFailure> {
        let pair = context.cleaned.get(segment.index).ok_or_else(|| SegmentFailure {
            stage: SegmentStage::FrameEdit,
            message: "no text-removed boundary frames".to_string(),
            attempts: 0,
        })?;

        let editor = FrameEditor::new(
            &self.perception,
            &self.generation,
            context.registry,
            context.identities,
            &self.config.frame_edit,
        );
        let edited = editor
            .edit_segment(
                segment,
                |boundary| pair.get(boundary).to_path_buf(),
                |boundary| context.work_dir.edited_frame(segment.index, boundary),
                cancel,
            )
            .await
            .map_err(|e| match e {
                FrameEditError::Cancelled => cancelled_failure(0),
                e => SegmentFailure {
                    stage: SegmentStage::FrameEdit,
                    attempts: e.attempts(),
                    message: e.to_string(),
                },
            })?;

        let generator = SegmentGenerator::new(
            &self.media,
            &self.generation,
            &self.config.generation,
            context.source,
            context.work_dir,
        );
        let generated = generator
            .generate(segment, &edited, cancel)
            .await
            .map_err(|e| match e {
                SegmentGenerationError::Cancelled => cancelled_failure(edited.attempts()),
                e => SegmentFailure {
                    stage: SegmentStage::Generation,
                    attempts: edited.attempts() + e.attempts(),
                    message: e.to_string(),
                },
            })?;

        Ok((generated, edited.attempts()))
    }

    /// Copy a video file or image sequence directory to `output`
    async fn copy_to_output(&self, video: &Path, output: &Path) -> Result<(), StageFailure> {
        copy_media(video, output).await.map_err(failed_at(RunStage::Output))?;
        info!("Wrote {}", output.display());
        Ok(())
    }
}

fn cancelled_failure(attempts: u32) -> SegmentFailure {
    SegmentFailure {
        stage: SegmentStage::Cancelled,
        message: "cancelled while in progress".to_string(),
        attempts,
    }
}

/// Resize an image file in place when it is not `width`x`height`
async fn match_dimensions(path: &Path, width: u32, height: u32) -> Result<(), MediaError> {
    let (actual_width, actual_height) = image::image_dimensions(path)?;
    if (actual_width, actual_height) == (width, height) {
        return Ok(());
    }

    debug!(
        "Resizing {} from {}x{} to {}x{}",
        path.display(),
        actual_width,
        actual_height,
        width,
        height
    );
    let frame = load_rgba(path).await?;
    let resized = tokio::task::spawn_blocking(move || {
        image::imageops::resize(&frame, width, height, FilterType::Lanczos3)
    })
    .await
    .map_err(|e| MediaError::TaskFailed(e.to_string()))?;
    save_png(resized, path).await
}

async fn copy_media(from: &Path, to: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if !from.is_dir() {
        tokio::fs::copy(from, to).await?;
        return Ok(());
    }

    if to.exists() {
        tokio::fs::remove_dir_all(to).await?;
    }
    tokio::fs::create_dir_all(to).await?;
    let mut entries = tokio::fs::read_dir(from).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::copy(entry.path(), to.join(entry.file_name())).await?;
        }
    }
    Ok(())
}
