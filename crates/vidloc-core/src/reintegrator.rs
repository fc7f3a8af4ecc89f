//! Text layer reintegration
//!
//! Overwrites the masked region of every frame in the layer's active span
//! with the preserved overlay pixels. The timeline's own content under the
//! mask is never read.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use thiserror::Error;
use tracing::{debug, info};

use crate::media::{MediaBackend, MediaError};
use crate::text_layer::{CompositeError, TextLayer};
use crate::types::VideoInfo;

/// Reintegration errors
#[derive(Error, Debug)]
pub enum ReintegrationError {
    /// Media error
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Layer could not be applied
    #[error("Composite error: {0}")]
    Composite(#[from] CompositeError),

    /// Image encode/decode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task failed
    #[error("Reintegration task failed: {0}")]
    TaskFailed(String),
}

/// Composites a text layer onto a reassembled timeline
pub struct TextReintegrator<'a, M> {
    media: &'a M,
    source: VideoInfo,
}

impl<'a, M: MediaBackend> TextReintegrator<'a, M> {
    pub fn new(media: &'a M, source: VideoInfo) -> Self {
        Self { media, source }
    }

    /// Write `timeline` with `layer` restored to `output`, using `frames_dir` as scratch
    pub async fn reintegrate(
        &self,
        timeline: &Path,
        layer: &TextLayer,
        frames_dir: &Path,
        output: &Path,
    ) -> Result<PathBuf, ReintegrationError> {
        if frames_dir.exists() {
            tokio::fs::remove_dir_all(frames_dir).await?;
        }
        let frames = self.media.unpack(timeline, frames_dir).await?;

        let (width, height) = (self.source.width, self.source.height);
        let mut composited = 0usize;
        let mut resized = 0usize;

        for (index, path) in frames.iter().enumerate() {
            let in_span = layer.active().contains(index as u64);
            let (frame_width, frame_height) = image::image_dimensions(path)?;
            let needs_resize = (frame_width, frame_height) != (width, height);
            if !in_span && !needs_resize {
                continue;
            }

            let path = path.clone();
            let layer = layer.clone();
            tokio::task::spawn_blocking(move || -> Result<(), ReintegrationError> {
                let mut frame = image::open(&path)?.to_rgba8();
                if needs_resize {
                    frame = image::imageops::resize(&frame, width, height, FilterType::Lanczos3);
                }
                if in_span {
                    layer.composite(&mut frame)?;
                }
                frame.save_with_format(&path, image::ImageFormat::Png)?;
                Ok(())
            })
            .await
            .map_err(|e| ReintegrationError::TaskFailed(e.to_string()))??;

            if needs_resize {
                resized += 1;
            }
            if in_span {
                composited += 1;
            }
        }

        debug!("Resized {} frame(s) to {}x{}", resized, width, height);

        self.media.pack(frames_dir, self.source.fps, output).await?;

        info!(
            "Reintegrated text layer on {} of {} frames into {}",
            composited,
            frames.len(),
            output.display()
        );
        Ok(output.to_path_buf())
    }
}
