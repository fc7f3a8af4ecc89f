//! Video access
//!
//! Every component reaches video frames through [`MediaBackend`]. Two
//! implementations ship with the crate: [`FfmpegBackend`] for container
//! files and [`ImageSequenceBackend`] for directories of numbered PNG frames.

pub mod ffmpeg;
pub mod sequence;

use std::path::{Path, PathBuf};

use image::RgbaImage;
use thiserror::Error;

use crate::types::{ClipFormat, FrameSpan, VideoInfo};

pub use ffmpeg::{FfmpegBackend, FfmpegConfig};
pub use sequence::{ImageSequenceBackend, SequenceManifest};

/// Media errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// ffmpeg/ffprobe could not be spawned
    #[error("ffprobe/ffmpeg binary not found: {0}")]
    ToolNotFound(std::io::Error),

    /// External tool exited with an error
    #[error("ffprobe/ffmpeg execution failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Tool output could not be parsed
    #[error("Failed to parse media info: {0}")]
    ParseError(String),

    /// Input does not exist
    #[error("Video not found: {0}")]
    NotFound(String),

    /// Requested frame is past the end of the video
    #[error("Frame {index} out of range (video has {frame_count} frames)")]
    FrameOutOfRange { index: u64, frame_count: u64 },

    /// Operation not supported for the given input
    #[error("Unsupported media operation: {0}")]
    Unsupported(String),

    /// Image encode/decode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task failed
    #[error("Media task failed: {0}")]
    TaskFailed(String),
}

/// Callback receiving decoded frames in ascending index order
pub type FrameVisitor<'a> = dyn FnMut(u64, RgbaImage) -> Result<(), MediaError> + Send + 'a;

/// Video decode/encode backend
#[trait_variant::make(MediaBackend: Send)]
pub trait LocalMediaBackend {
    /// Read stream properties
    async fn probe(&self, video: &Path) -> Result<VideoInfo, MediaError>;

    /// Decode one frame
    async fn read_frame(&self, video: &Path, index: u64) -> Result<RgbaImage, MediaError>;

    /// Decode the given frames (sorted ascending) and hand each to `visitor`
    async fn scan_frames(
        &self,
        video: &Path,
        indices: &[u64],
        visitor: &mut FrameVisitor<'_>,
    ) -> Result<(), MediaError>;

    /// Write the frames of `span` as a standalone clip
    async fn cut(&self, video: &Path, span: FrameSpan, output: &Path) -> Result<(), MediaError>;

    /// Re-time and rescale a clip to the given format, stretched onto `format.frames` when set
    async fn conform(&self, clip: &Path, format: ClipFormat, output: &Path) -> Result<(), MediaError>;

    /// Join clips end to end
    async fn concat(&self, clips: &[PathBuf], output: &Path) -> Result<(), MediaError>;

    /// Write every frame to `dir` as `frame_NNNNNN.png`, returning the paths in order
    async fn unpack(&self, video: &Path, dir: &Path) -> Result<Vec<PathBuf>, MediaError>;

    /// Encode the `frame_NNNNNN.png` files of `dir` into a video
    async fn pack(&self, dir: &Path, fps: f64, output: &Path) -> Result<(), MediaError>;

    /// Copy the audio of `audio_source` onto `video`
    async fn mux_audio(&self, video: &Path, audio_source: &Path, output: &Path) -> Result<(), MediaError>;

    /// Extension for clips produced by this backend (empty for directories)
    fn clip_extension(&self) -> &'static str;
}

/// File name of a frame inside an unpacked directory
pub fn frame_file_name(index: u64) -> String {
    format!("frame_{:06}.png", index)
}

/// Sorted `frame_*.png` files of a directory
pub async fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
    let mut frames = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("frame_") && name.ends_with(".png") {
            frames.push(entry.path());
        }
    }
    frames.sort();
    Ok(frames)
}

/// `count` frame indices spread evenly over `[0, frame_count)`
pub fn sample_indices(frame_count: u64, count: usize) -> Vec<u64> {
    if frame_count == 0 || count == 0 {
        return Vec::new();
    }
    if count as u64 >= frame_count {
        return (0..frame_count).collect();
    }

    let step = frame_count as f64 / count as f64;
    let mut indices: Vec<u64> = (0..count)
        .map(|i| ((i as f64 * step).floor() as u64).min(frame_count - 1))
        .collect();
    indices.dedup();
    indices
}

/// Decode an image file to RGBA on the blocking pool
pub async fn load_rgba(path: &Path) -> Result<RgbaImage, MediaError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || Ok(image::open(&path)?.to_rgba8()))
        .await
        .map_err(|e| MediaError::TaskFailed(e.to_string()))?
}

/// Encode an RGBA image to PNG on the blocking pool
pub async fn save_png(image: RgbaImage, path: &Path) -> Result<(), MediaError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        image.save_with_format(&path, image::ImageFormat::Png)?;
        Ok(())
    })
    .await
    .map_err(|e| MediaError::TaskFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_indices_even_spread() {
        assert_eq!(sample_indices(10, 5), vec![0, 2, 4, 6, 8]);
        assert_eq!(sample_indices(3, 10), vec![0, 1, 2]);
        assert!(sample_indices(0, 4).is_empty());
    }

    #[test]
    fn test_frame_file_name() {
        assert_eq!(frame_file_name(42), "frame_000042.png");
    }
}
