//! Step results persisted in the artifact cache

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vidloc_artifacts::Artifact;
use vidloc_core::{Boundary, FrameSpan, GeneratedSegment, Segment};

/// Segment plan with its boundary frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentPlan(pub Vec<Segment>);

impl Artifact for SegmentPlan {
    fn referenced_paths(&self) -> Vec<PathBuf> {
        self.0
            .iter()
            .flat_map(|s| [s.start_frame.path.clone(), s.end_frame.path.clone()])
            .collect()
    }
}

/// Saved text layer image and the frames it applies to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedTextLayer {
    pub path: PathBuf,
    pub active: FrameSpan,
}

impl Artifact for SavedTextLayer {
    fn referenced_paths(&self) -> Vec<PathBuf> {
        vec![self.path.clone()]
    }
}

/// Text-removed start and end frame of one segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanedPair {
    pub start: PathBuf,
    pub end: PathBuf,
}

impl CleanedPair {
    pub fn get(&self, boundary: Boundary) -> &Path {
        match boundary {
            Boundary::Start => &self.start,
            Boundary::End => &self.end,
        }
    }
}

/// Text-removed boundary frames, indexed by segment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CleanedFrames(pub Vec<CleanedPair>);

impl CleanedFrames {
    pub fn get(&self, segment_index: usize) -> Option<&CleanedPair> {
        self.0.get(segment_index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Artifact for CleanedFrames {
    fn referenced_paths(&self) -> Vec<PathBuf> {
        self.0
            .iter()
            .flat_map(|p| [p.start.clone(), p.end.clone()])
            .collect()
    }
}

/// Finished segment clip
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentResult(pub GeneratedSegment);

impl Artifact for SegmentResult {
    fn referenced_paths(&self) -> Vec<PathBuf> {
        vec![self.0.clip.clone()]
    }
}
