//! Image sequence backend
//!
//! A "video" is a directory of `frame_000000.png`, `frame_000001.png`, ...
//! plus a `sequence.json` manifest holding the frame rate. Image sequences
//! carry no audio.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{frame_file_name, list_frames, load_rgba, save_png, FrameVisitor, MediaBackend, MediaError};
use crate::types::{ClipFormat, FrameSpan, VideoInfo};

/// Manifest file stored next to the frames
pub const SEQUENCE_MANIFEST: &str = "sequence.json";

/// Image sequence metadata
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequenceManifest {
    /// Frames per second
    pub fps: f64,
}

impl SequenceManifest {
    pub async fn read(dir: &Path) -> Result<Self, MediaError> {
        let path = dir.join(SEQUENCE_MANIFEST);
        if !path.exists() {
            return Err(MediaError::NotFound(path.display().to_string()));
        }
        let data = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&data).map_err(|e| MediaError::ParseError(e.to_string()))
    }

    pub async fn write(&self, dir: &Path) -> Result<(), MediaError> {
        tokio::fs::create_dir_all(dir).await?;
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| MediaError::ParseError(e.to_string()))?;
        tokio::fs::write(dir.join(SEQUENCE_MANIFEST), data).await?;
        Ok(())
    }
}

/// Media backend for PNG image sequences
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageSequenceBackend;

impl ImageSequenceBackend {
    pub fn new() -> Self {
        Self
    }

    /// Write frames as a new sequence at `dir`
    pub async fn write_sequence(
        &self,
        dir: &Path,
        fps: f64,
        frames: impl IntoIterator<Item = RgbaImage>,
    ) -> Result<(), MediaError> {
        reset_dir(dir).await?;
        for (index, frame) in frames.into_iter().enumerate() {
            save_png(frame, &dir.join(frame_file_name(index as u64))).await?;
        }
        SequenceManifest { fps }.write(dir).await
    }
}

async fn reset_dir(dir: &Path) -> Result<(), MediaError> {
    if dir.exists() {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

async fn frame_path(video: &Path, index: u64) -> Result<PathBuf, MediaError> {
    let path = video.join(frame_file_name(index));
    if path.exists() {
        Ok(path)
    } else {
        let frame_count = list_frames(video).await?.len() as u64;
        Err(MediaError::FrameOutOfRange { index, frame_count })
    }
}

impl MediaBackend for ImageSequenceBackend {
    async fn probe(&self, video: &Path) -> Result<VideoInfo, MediaError> {
        if !video.is_dir() {
            return Err(MediaError::NotFound(video.display().to_string()));
        }

        let manifest = SequenceManifest::read(video).await?;
        let frames = list_frames(video).await?;
        let (width, height) = match frames.first() {
            Some(first) => image::image_dimensions(first)?,
            None => (0, 0),
        };

        Ok(VideoInfo {
            path: video.to_path_buf(),
            width,
            height,
            fps: manifest.fps,
            frame_count: frames.len() as u64,
            has_audio: false,
        })
    }

    async fn read_frame(&self, video: &Path, index: u64) -> Result<RgbaImage, MediaError> {
        let path = frame_path(video, index).await?;
        load_rgba(&path).await
    }

    async fn scan_frames(
        &self,
        video: &Path,
        indices: &[u64],
        visitor: &mut FrameVisitor<'_>,
    ) -> Result<(), MediaError> {
        for &index in indices {
            let path = frame_path(video, index).await?;
            let frame = load_rgba(&path).await?;
            visitor(index, frame)?;
        }
        Ok(())
    }

    async fn cut(&self, video: &Path, span: FrameSpan, output: &Path) -> Result<(), MediaError> {
        let manifest = SequenceManifest::read(video).await?;
        reset_dir(output).await?;

        for (offset, index) in (span.start..span.end).enumerate() {
            let source = frame_path(video, index).await?;
            tokio::fs::copy(&source, output.join(frame_file_name(offset as u64))).await?;
        }
        manifest.write(output).await?;

        info!("Cut frames {}..{} into {}", span.start, span.end, output.display());
        Ok(())
    }

    async fn conform(&self, clip: &Path, format: ClipFormat, output: &Path) -> Result<(), MediaError> {
        let info = self.probe(clip).await?;
        if info.frame_count == 0 || info.fps <= 0.0 || format.fps <= 0.0 {
            return Err(MediaError::Unsupported(format!(
                "cannot conform empty sequence {}",
                clip.display()
            )));
        }

        let target_count = format
            .frames
            .unwrap_or_else(|| (info.duration() * format.fps).round() as u64)
            .max(1);
        // With an exact frame count the source is spread evenly over the output
        let step = match format.frames {
            Some(_) => info.frame_count as f64 / target_count as f64,
            None => info.fps / format.fps,
        };
        let resize = info.width != format.width || info.height != format.height;

        // Conforming in place needs a staging directory
        let staging = output.with_extension("conform");
        reset_dir(&staging).await?;

        for target in 0..target_count {
            let source_index = ((target as f64 * step).floor() as u64).min(info.frame_count - 1);
            let source = frame_path(clip, source_index).await?;
            let destination = staging.join(frame_file_name(target));

            if resize {
                let frame = load_rgba(&source).await?;
                let resized = image::imageops::resize(&frame, format.width, format.height, FilterType::Triangle);
                save_png(resized, &destination).await?;
            } else {
                tokio::fs::copy(&source, &destination).await?;
            }
        }
        SequenceManifest { fps: format.fps }.write(&staging).await?;

        if output.exists() {
            tokio::fs::remove_dir_all(output).await?;
        }
        tokio::fs::rename(&staging, output).await?;

        debug!(
            "Conformed {} ({} frames @ {}) to {} frames @ {}",
            clip.display(),
            info.frame_count,
            info.fps,
            target_count,
            format.fps
        );
        Ok(())
    }

    async fn concat(&self, clips: &[PathBuf], output: &Path) -> Result<(), MediaError> {
        let first = clips
            .first()
            .ok_or_else(|| MediaError::Unsupported("nothing to concatenate".to_string()))?;
        let manifest = SequenceManifest::read(first).await?;
        reset_dir(output).await?;

        let mut next = 0u64;
        for clip in clips {
            let clip_manifest = SequenceManifest::read(clip).await?;
            if (clip_manifest.fps - manifest.fps).abs() > 1e-6 {
                return Err(MediaError::Unsupported(format!(
                    "frame rate mismatch: {} is {} fps, expected {}",
                    clip.display(),
                    clip_manifest.fps,
                    manifest.fps
                )));
            }
            for frame in list_frames(clip).await? {
                tokio::fs::copy(&frame, output.join(frame_file_name(next))).await?;
                next += 1;
            }
        }
        manifest.write(output).await?;

        info!("Concatenated {} clips ({} frames) into {}", clips.len(), next, output.display());
        Ok(())
    }

    async fn unpack(&self, video: &Path, dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
        tokio::fs::create_dir_all(dir).await?;
        let mut unpacked = Vec::new();
        for (index, frame) in list_frames(video).await?.into_iter().enumerate() {
            let destination = dir.join(frame_file_name(index as u64));
            tokio::fs::copy(&frame, &destination).await?;
            unpacked.push(destination);
        }
        Ok(unpacked)
    }

    async fn pack(&self, dir: &Path, fps: f64, output: &Path) -> Result<(), MediaError> {
        let frames = list_frames(dir).await?;
        reset_dir(output).await?;
        for (index, frame) in frames.iter().enumerate() {
            tokio::fs::copy(frame, output.join(frame_file_name(index as u64))).await?;
        }
        SequenceManifest { fps }.write(output).await
    }

    async fn mux_audio(&self, video: &Path, _audio_source: &Path, output: &Path) -> Result<(), MediaError> {
        let manifest = SequenceManifest::read(video).await?;
        let frames = list_frames(video).await?;
        reset_dir(output).await?;
        for frame in frames {
            if let Some(name) = frame.file_name() {
                tokio::fs::copy(&frame, output.join(name)).await?;
            }
        }
        manifest.write(output).await
    }

    fn clip_extension(&self) -> &'static str {
        ""
    }
}
