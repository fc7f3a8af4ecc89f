//! Video segmentation
//!
//! Splits the source into ordered, gap-free segments and writes each
//! segment's first and last frame as PNG conditioning anchors.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::media::{MediaBackend, MediaError};
use crate::shots::ShotDetector;
use crate::types::{FrameImage, FrameSpan, Segment, VideoInfo};

/// Segmentation errors
#[derive(Error, Debug)]
pub enum SegmentationError {
    /// Video has no frames or no frame rate
    #[error("Video has zero usable duration: {0}")]
    ZeroDuration(String),

    /// Video cannot be decoded
    #[error("Video cannot be decoded: {0}")]
    Undecodable(String),

    /// Too few frames to form a segment with distinct boundary frames
    #[error("Video has {frames} frame(s), at least {min} are required")]
    TooShort { frames: u64, min: u64 },

    /// Policy parameters are unusable
    #[error("Invalid segmentation policy: {0}")]
    InvalidPolicy(String),

    /// Media error while extracting boundary frames
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

/// How the timeline is split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SegmentationPolicy {
    /// Equal-length segments
    FixedInterval {
        /// Segment length in seconds
        interval_secs: f64,
    },
    /// Cut at detected shot changes
    ShotBoundary {
        /// Histogram distance threshold (0.0 - 1.0)
        threshold: f64,
        /// Cuts closer than this to the previous one are ignored
        min_shot_secs: f64,
        /// Longer shots are split evenly to stay under this length
        max_segment_secs: f64,
        /// Rate at which frames are sampled for detection
        sample_fps: f64,
    },
}

impl Default for SegmentationPolicy {
    fn default() -> Self {
        SegmentationPolicy::FixedInterval { interval_secs: 8.0 }
    }
}

impl SegmentationPolicy {
    /// Shot detection with the default tuning
    pub fn shot_boundary() -> Self {
        SegmentationPolicy::ShotBoundary {
            threshold: 0.3,
            min_shot_secs: 0.5,
            max_segment_secs: 8.0,
            sample_fps: 5.0,
        }
    }
}

/// Segmenter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    pub policy: SegmentationPolicy,
    /// Segments with fewer frames are merged into a neighbor
    pub min_segment_frames: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            policy: SegmentationPolicy::default(),
            min_segment_frames: 2,
        }
    }
}

/// Video segmenter
pub struct Segmenter {
    config: SegmenterConfig,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    /// Plan segments and write their boundary frames to `frames_dir`
    pub async fn segment<M: MediaBackend>(
        &self,
        media: &M,
        source: &Path,
        frames_dir: &Path,
    ) -> Result<Vec<Segment>, SegmentationError> {
        let info = media
            .probe(source)
            .await
            .map_err(|e| SegmentationError::Undecodable(e.to_string()))?;

        self.check_duration(&info)?;

        let cuts = match &self.config.policy {
            SegmentationPolicy::FixedInterval { .. } => Vec::new(),
            SegmentationPolicy::ShotBoundary {
                threshold,
                min_shot_secs,
                sample_fps,
                ..
            } => detect_shot_cuts(media, &info, *threshold, *min_shot_secs, *sample_fps).await?,
        };

        let spans = self.plan(&info, &cuts)?;
        info!(
            "Split {} ({:.2}s @ {} fps) into {} segments",
            source.display(),
            info.duration(),
            info.fps,
            spans.len()
        );

        let frames = extract_boundary_frames(media, source, &spans, frames_dir).await?;

        let segments = spans
            .iter()
            .enumerate()
            .map(|(index, span)| {
                let start_frame = frames.get(&span.start).cloned();
                let end_frame = frames.get(&span.last()).cloned();
                match (start_frame, end_frame) {
                    (Some(start_frame), Some(end_frame)) => Ok(Segment {
                        index,
                        span: *span,
                        fps: info.fps,
                        start_frame,
                        end_frame,
                    }),
                    _ => Err(SegmentationError::Undecodable(format!(
                        "boundary frames of segment {} could not be decoded",
                        index
                    ))),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(segments)
    }

    /// Frame spans for a video, given shot cut positions (empty for fixed intervals)
    pub fn plan(&self, info: &VideoInfo, cuts: &[u64]) -> Result<Vec<FrameSpan>, SegmentationError> {
        self.check_duration(info)?;
        let min_frames = self.config.min_segment_frames.max(1);

        let spans = match &self.config.policy {
            SegmentationPolicy::FixedInterval { interval_secs } => {
                if !(*interval_secs > 0.0) {
                    return Err(SegmentationError::InvalidPolicy(format!(
                        "interval must be positive, got {}",
                        interval_secs
                    )));
                }
                let per_segment = ((interval_secs * info.fps).round() as u64).max(1);
                fixed_interval_spans(info.frame_count, per_segment)
            }
            SegmentationPolicy::ShotBoundary { max_segment_secs, .. } => {
                if !(*max_segment_secs > 0.0) {
                    return Err(SegmentationError::InvalidPolicy(format!(
                        "max segment length must be positive, got {}",
                        max_segment_secs
                    )));
                }
                let max_frames = ((max_segment_secs * info.fps).floor() as u64).max(1);
                let shots = spans_from_cuts(info.frame_count, cuts);
                split_long_spans(&shots, max_frames)
            }
        };

        let spans = merge_short_spans(spans, min_frames);
        debug!("Planned spans: {:?}", spans);
        Ok(spans)
    }

    fn check_duration(&self, info: &VideoInfo) -> Result<(), SegmentationError> {
        if info.frame_count == 0 || info.fps <= 0.0 {
            return Err(SegmentationError::ZeroDuration(info.path.display().to_string()));
        }
        let min = self.config.min_segment_frames.max(1);
        if info.frame_count < min {
            return Err(SegmentationError::TooShort {
                frames: info.frame_count,
                min,
            });
        }
        Ok(())
    }
}

/// Consecutive spans of `per_segment` frames; the last one keeps the remainder
pub fn fixed_interval_spans(frame_count: u64, per_segment: u64) -> Vec<FrameSpan> {
    let per_segment = per_segment.max(1);
    (0..frame_count)
        .step_by(per_segment as usize)
        .map(|start| FrameSpan::new(start, (start + per_segment).min(frame_count)))
        .collect()
}

/// Spans delimited by cut frame indices
pub fn spans_from_cuts(frame_count: u64, cuts: &[u64]) -> Vec<FrameSpan> {
    let mut boundaries: Vec<u64> = cuts
        .iter()
        .copied()
        .filter(|&c| c > 0 && c < frame_count)
        .collect();
    boundaries.sort_unstable();
    boundaries.dedup();

    let mut spans = Vec::with_capacity(boundaries.len() + 1);
    let mut start = 0;
    for cut in boundaries {
        spans.push(FrameSpan::new(start, cut));
        start = cut;
    }
    spans.push(FrameSpan::new(start, frame_count));
    spans
}

/// Split spans longer than `max_frames` into equal parts
pub fn split_long_spans(spans: &[FrameSpan], max_frames: u64) -> Vec<FrameSpan> {
    let max_frames = max_frames.max(1);
    let mut result = Vec::with_capacity(spans.len());

    for span in spans {
        let len = span.len();
        if len <= max_frames {
            result.push(*span);
            continue;
        }

        let parts = len.div_ceil(max_frames);
        let mut start = span.start;
        for part in 0..parts {
            // Distribute the remainder over the first parts
            let size = len / parts + u64::from(part < len % parts);
            result.push(FrameSpan::new(start, start + size));
            start += size;
        }
    }

    result
}

/// Merge spans shorter than `min_frames` into the previous span (or the next, for the first)
pub fn merge_short_spans(spans: Vec<FrameSpan>, min_frames: u64) -> Vec<FrameSpan> {
    let mut merged: Vec<FrameSpan> = Vec::with_capacity(spans.len());
    let mut carry: Option<FrameSpan> = None;

    for span in spans {
        let span = match carry.take() {
            Some(previous) => FrameSpan::new(previous.start, span.end),
            None => span,
        };

        if span.len() >= min_frames {
            merged.push(span);
        } else if let Some(last) = merged.last_mut() {
            last.end = span.end;
        } else {
            carry = Some(span);
        }
    }

    // Everything was short: keep it as one span
    if let Some(span) = carry {
        merged.push(span);
    }

    merged.retain(|s| !s.is_empty());
    merged
}

async fn detect_shot_cuts<M: MediaBackend>(
    media: &M,
    info: &VideoInfo,
    threshold: f64,
    min_shot_secs: f64,
    sample_fps: f64,
) -> Result<Vec<u64>, SegmentationError> {
    if !(sample_fps > 0.0) {
        return Err(SegmentationError::InvalidPolicy(format!(
            "sample rate must be positive, got {}",
            sample_fps
        )));
    }

    let stride = ((info.fps / sample_fps).round() as u64).max(1);
    let indices: Vec<u64> = (0..info.frame_count).step_by(stride as usize).collect();
    let min_samples = ((min_shot_secs * sample_fps).ceil() as usize).max(1);
    let detector = ShotDetector::new()
        .with_threshold(threshold)
        .with_min_samples(min_samples);

    let mut histograms = Vec::with_capacity(indices.len());
    media
        .scan_frames(&info.path, &indices, &mut |_, frame| {
            histograms.push(detector.compute_histogram(&frame));
            Ok(())
        })
        .await
        .map_err(|e| SegmentationError::Undecodable(e.to_string()))?;

    let cuts: Vec<u64> = detector
        .detect_cuts(&histograms)
        .into_iter()
        .filter_map(|sample| indices.get(sample).copied())
        .collect();

    info!("Detected {} shot cuts", cuts.len());
    Ok(cuts)
}

/// Decode every boundary frame in one pass and write it as PNG
async fn extract_boundary_frames<M: MediaBackend>(
    media: &M,
    source: &Path,
    spans: &[FrameSpan],
    frames_dir: &Path,
) -> Result<BTreeMap<u64, FrameImage>, SegmentationError> {
    tokio::fs::create_dir_all(frames_dir)
        .await
        .map_err(MediaError::from)?;

    let mut indices: Vec<u64> = spans.iter().flat_map(|s| [s.start, s.last()]).collect();
    indices.sort_unstable();
    indices.dedup();

    let mut frames = BTreeMap::new();
    let mut writes = Vec::with_capacity(indices.len());
    media
        .scan_frames(source, &indices, &mut |index, frame| {
            let path = frames_dir.join(format!("source_{:06}.png", index));
            let target = path.clone();
            // PNG encoding runs on the blocking pool while decoding continues
            writes.push(tokio::task::spawn_blocking(move || {
                frame.save_with_format(&target, image::ImageFormat::Png)
            }));
            frames.insert(
                index,
                FrameImage {
                    frame_index: index,
                    path,
                },
            );
            Ok(())
        })
        .await
        .map_err(|e| SegmentationError::Undecodable(e.to_string()))?;

    for write in writes {
        write
            .await
            .map_err(|e| MediaError::TaskFailed(e.to_string()))?
            .map_err(MediaError::from)?;
    }

    debug!("Wrote {} boundary frames to {}", frames.len(), frames_dir.display());
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ImageSequenceBackend;
    use image::{Rgba, RgbaImage};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_info(frame_count: u64, fps: f64) -> VideoInfo {
        VideoInfo {
            path: PathBuf::from("source.mp4"),
            width: 1080,
            height: 1920,
            fps,
            frame_count,
            has_audio: false,
        }
    }

    fn fixed(interval_secs: f64) -> Segmenter {
        Segmenter::new(SegmenterConfig {
            policy: SegmentationPolicy::FixedInterval { interval_secs },
            min_segment_frames: 2,
        })
    }

    #[test]
    fn test_twenty_seconds_in_five_second_intervals() {
        let info = create_test_info(600, 30.0);
        let spans = fixed(5.0).plan(&info, &[]).unwrap();

        assert_eq!(spans.len(), 4);
        let boundaries: Vec<f64> = spans
            .iter()
            .map(|s| info.time_of(s.start))
            .chain(std::iter::once(info.time_of(spans[3].end)))
            .collect();
        assert_eq!(boundaries, vec![0.0, 5.0, 10.0, 15.0, 20.0]);
    }

    #[test]
    fn test_spans_cover_timeline_without_gaps() {
        let info = create_test_info(617, 29.97);
        let spans = fixed(4.0).plan(&info, &[]).unwrap();

        assert_eq!(spans[0].start, 0);
        assert_eq!(spans.last().unwrap().end, 617);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        let total: u64 = spans.iter().map(|s| s.len()).sum();
        assert_eq!(total, 617);
    }

    #[test]
    fn test_single_frame_remainder_is_merged() {
        // 10 frames per segment, 21 frames: the last frame would be alone
        let info = create_test_info(21, 10.0);
        let spans = fixed(1.0).plan(&info, &[]).unwrap();
        assert_eq!(spans, vec![FrameSpan::new(0, 10), FrameSpan::new(10, 21)]);
    }

    #[test]
    fn test_merge_short_first_span_into_next() {
        let spans = vec![FrameSpan::new(0, 1), FrameSpan::new(1, 10), FrameSpan::new(10, 20)];
        let merged = merge_short_spans(spans, 2);
        assert_eq!(merged, vec![FrameSpan::new(0, 10), FrameSpan::new(10, 20)]);
    }

    #[test]
    fn test_split_long_spans_evenly() {
        let split = split_long_spans(&[FrameSpan::new(0, 25)], 10);
        assert_eq!(
            split,
            vec![FrameSpan::new(0, 9), FrameSpan::new(9, 17), FrameSpan::new(17, 25)]
        );
    }

    #[test]
    fn test_shot_plan_uses_cuts_and_max_length() {
        let segmenter = Segmenter::new(SegmenterConfig {
            policy: SegmentationPolicy::ShotBoundary {
                threshold: 0.3,
                min_shot_secs: 0.5,
                max_segment_secs: 2.0,
                sample_fps: 5.0,
            },
            min_segment_frames: 2,
        });
        let info = create_test_info(50, 10.0);
        let spans = segmenter.plan(&info, &[15]).unwrap();
        assert_eq!(
            spans,
            vec![
                FrameSpan::new(0, 15),
                FrameSpan::new(15, 33),
                FrameSpan::new(33, 50),
            ]
        );
    }

    #[test]
    fn test_zero_duration_is_error() {
        let info = create_test_info(0, 30.0);
        assert!(matches!(
            fixed(5.0).plan(&info, &[]),
            Err(SegmentationError::ZeroDuration(_))
        ));
    }

    #[test]
    fn test_invalid_interval_is_error() {
        let info = create_test_info(100, 30.0);
        assert!(matches!(
            fixed(0.0).plan(&info, &[]),
            Err(SegmentationError::InvalidPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_segment_writes_boundary_frames() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let frames = (0..8u8).map(|i| RgbaImage::from_pixel(4, 4, Rgba([i * 10, 0, 0, 255])));
        ImageSequenceBackend
            .write_sequence(&source, 2.0, frames)
            .await
            .unwrap();

        let segments = fixed(2.0)
            .segment(&ImageSequenceBackend, &source, &temp.path().join("frames"))
            .await
            .unwrap();

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].start_frame.frame_index, 4);
        assert_eq!(segments[1].end_frame.frame_index, 7);
        let end = image::open(&segments[1].end_frame.path).unwrap().to_rgba8();
        assert_eq!(end.get_pixel(0, 0), &Rgba([70, 0, 0, 255]));
    }

    #[tokio::test]
    async fn test_all_boundary_frames_written_before_return() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let frames = (0..40u8).map(|i| RgbaImage::from_pixel(4, 4, Rgba([i * 5, 0, 0, 255])));
        ImageSequenceBackend
            .write_sequence(&source, 4.0, frames)
            .await
            .unwrap();

        let segments = fixed(1.0)
            .segment(&ImageSequenceBackend, &source, &temp.path().join("frames"))
            .await
            .unwrap();

        assert_eq!(segments.len(), 10);
        for segment in &segments {
            for frame in [&segment.start_frame, &segment.end_frame] {
                let image = image::open(&frame.path).unwrap().to_rgba8();
                assert_eq!(image.get_pixel(0, 0)[0], frame.frame_index as u8 * 5);
            }
        }
    }

    #[tokio::test]
    async fn test_missing_video_is_undecodable() {
        let temp = TempDir::new().unwrap();
        let result = fixed(2.0)
            .segment(&ImageSequenceBackend, &temp.path().join("missing"), temp.path())
            .await;
        assert!(matches!(result, Err(SegmentationError::Undecodable(_))));
    }
}
