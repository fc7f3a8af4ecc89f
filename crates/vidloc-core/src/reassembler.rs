//! Timeline reassembly
//!
//! Concatenates per-segment clips in source order. The result must last as
//! long as the source to within one frame interval; anything beyond that is
//! reported, never trimmed away.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::media::{MediaBackend, MediaError};
use crate::types::{FrameSpan, VideoInfo};

/// Reassembly errors
#[derive(Error, Debug)]
pub enum ReassemblyError {
    /// Duration differs from the source by more than the tolerance
    #[error("Timeline drift: expected {expected:.3}s, got {actual:.3}s (tolerance {tolerance:.3}s)")]
    Drift {
        expected: f64,
        actual: f64,
        tolerance: f64,
    },

    /// Entries are not the contiguous sequence 0..n
    #[error("Segment at position {position} has index {index}")]
    OutOfOrder { position: usize, index: usize },

    /// Entry spans leave a gap, overlap, or stop short of the source
    #[error("Segment spans do not cover the source: {0}")]
    Coverage(String),

    /// Nothing to assemble
    #[error("No segments to reassemble")]
    Empty,

    /// Media error
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

/// Where a timeline clip came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipOrigin {
    Generated,
    Original,
}

/// One clip of the timeline
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub index: usize,
    pub clip: PathBuf,
    /// Source frames this clip stands in for
    pub expected: FrameSpan,
    pub origin: ClipOrigin,
}

/// Reassembled video
#[derive(Debug, Clone)]
pub struct Timeline {
    pub path: PathBuf,
    pub duration: f64,
    pub frame_count: u64,
}

/// Concatenates segment clips against a source
pub struct Reassembler<'a, M> {
    media: &'a M,
    source: VideoInfo,
}

impl<'a, M: MediaBackend> Reassembler<'a, M> {
    pub fn new(media: &'a M, source: VideoInfo) -> Self {
        Self { media, source }
    }

    /// Allowed duration difference in seconds
    pub fn tolerance(&self) -> f64 {
        self.source.frame_interval()
    }

    fn check_drift(&self, actual: f64) -> Result<(), ReassemblyError> {
        let expected = self.source.duration();
        let tolerance = self.tolerance();
        if (actual - expected).abs() > tolerance + 1e-9 {
            return Err(ReassemblyError::Drift {
                expected,
                actual,
                tolerance,
            });
        }
        Ok(())
    }

    fn check_order(&self, entries: &[TimelineEntry]) -> Result<(), ReassemblyError> {
        if entries.is_empty() {
            return Err(ReassemblyError::Empty);
        }

        let mut next_frame = 0u64;
        for (position, entry) in entries.iter().enumerate() {
            if entry.index != position {
                return Err(ReassemblyError::OutOfOrder {
                    position,
                    index: entry.index,
                });
            }
            if entry.expected.start != next_frame {
                return Err(ReassemblyError::Coverage(format!(
                    "segment {} starts at frame {}, expected {}",
                    entry.index, entry.expected.start, next_frame
                )));
            }
            next_frame = entry.expected.end;
        }

        if next_frame != self.source.frame_count {
            return Err(ReassemblyError::Coverage(format!(
                "segments end at frame {}, source has {}",
                next_frame, self.source.frame_count
            )));
        }
        Ok(())
    }

    /// Concatenate `entries` into `output` and verify the total duration
    pub async fn reassemble(
        &self,
        entries: &[TimelineEntry],
        output: &Path,
    ) -> Result<Timeline, ReassemblyError> {
        self.check_order(entries)?;

        let mut total = 0.0;
        for entry in entries {
            let info = self.media.probe(&entry.clip).await?;
            let expected = entry.expected.len() as f64 / self.source.fps;
            debug!(
                "Segment {} ({:?}): {:.3}s, source span {:.3}s",
                entry.index,
                entry.origin,
                info.duration(),
                expected
            );
            total += info.duration();
        }
        self.check_drift(total)?;

        let clips: Vec<PathBuf> = entries.iter().map(|e| e.clip.clone()).collect();
        self.media.concat(&clips, output).await?;

        let info = self.media.probe(output).await?;
        self.check_drift(info.duration())?;

        info!(
            "Reassembled {} segments into {} ({:.3}s, source {:.3}s)",
            entries.len(),
            output.display(),
            info.duration(),
            self.source.duration()
        );

        Ok(Timeline {
            path: output.to_path_buf(),
            duration: info.duration(),
            frame_count: info.frame_count,
        })
    }
}
