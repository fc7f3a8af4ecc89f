//! Subcommand handlers

use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vidloc_artifacts::ArtifactCache;
use vidloc_core::{
    Exporter, FfmpegBackend, ImageSequenceBackend, MarkerFormat, MediaBackend, RunOutcome, RunReport,
    TransformationTheme,
};
use vidloc_pipeline::{Pipeline, PipelineConfig, RunRequest};
use vidloc_vision::{GenerationProvider, PerceptionProvider};

use crate::config::Settings;
use crate::{ClearCacheArgs, RunArgs};

/// Localize one video and write its report
pub async fn run(args: RunArgs) -> Result<ExitCode> {
    let settings = Settings::from_env()?;

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    args.apply(&mut config);

    let request = RunRequest {
        source: args.input.clone(),
        output: args.output.clone(),
        theme: TransformationTheme::new(args.theme.clone()),
        work_dir: args
            .work_dir
            .clone()
            .or_else(|| settings.work_dir.clone())
            .unwrap_or_else(|| args.output.with_extension("work")),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let perception = settings.perception();
    let generation = settings.generation();

    let report = if args.image_sequence {
        localize(ImageSequenceBackend::new(), perception, generation, config, &request, &cancel, &args).await?
    } else {
        let media = FfmpegBackend::with_config(settings.ffmpeg.clone());
        localize(media, perception, generation, config, &request, &cancel, &args).await?
    };

    match &report.outcome {
        RunOutcome::Completed { output } => info!("Localized video written to {}", output.display()),
        RunOutcome::Passthrough { output, reason } => {
            info!("No edit needed ({:?}), source copied to {}", reason, output.display())
        }
        RunOutcome::Failed { stage, message } => warn!("Run failed at {:?}: {}", stage, message),
        RunOutcome::Cancelled => warn!("Run cancelled"),
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn localize<M, P, G>(
    media: M,
    perception: P,
    generation: G,
    config: PipelineConfig,
    request: &RunRequest,
    cancel: &CancellationToken,
    args: &RunArgs,
) -> Result<RunReport>
where
    M: MediaBackend + Sync,
    P: PerceptionProvider + Sync,
    G: GenerationProvider + Sync,
{
    let pipeline = Pipeline::new(media, perception, generation, config)?;
    info!(
        "Localizing {} with {} / {}",
        request.source.display(),
        pipeline.perception().name(),
        pipeline.generation().name()
    );

    let report = pipeline
        .run(request, cancel)
        .await
        .with_context(|| format!("Failed to run on {}", request.source.display()))?;

    let report_path = args.report_path();
    Exporter::to_json(&report, &report_path, true)
        .with_context(|| format!("Failed to write report {}", report_path.display()))?;
    info!("Run report written to {}", report_path.display());

    if let Some(edl) = &args.edl {
        let source = pipeline
            .media()
            .probe(&request.source)
            .await
            .context("Failed to probe source for EDL frame rate")?;
        Exporter::to_edl(&report, edl, source.fps, Some(request.theme.as_str()))
            .with_context(|| format!("Failed to write EDL {}", edl.display()))?;
    }
    if let Some(markers) = &args.markers {
        Exporter::to_markers(&report, markers, MarkerFormat::Csv)
            .with_context(|| format!("Failed to write markers {}", markers.display()))?;
    }

    Ok(report)
}

/// Remove one cached step, or all of them
pub async fn clear_cache(args: ClearCacheArgs) -> Result<ExitCode> {
    let cache = ArtifactCache::new();
    cache
        .clear(args.step.as_deref())
        .await
        .context("Failed to clear cache")?;

    match cache.cache_directory() {
        Some(dir) => info!("Cache cleared ({})", dir.display()),
        None => warn!("No cache directory available"),
    }
    Ok(ExitCode::SUCCESS)
}
