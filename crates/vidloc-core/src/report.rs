//! Run report types

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Region, TransformationTheme};

/// What happens to a segment whose edit or generation exhausted its retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop issuing new work and fail the run
    #[default]
    Abort,
    /// Put the original, unedited clip at the segment's position
    SubstituteOriginal,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Abort => write!(f, "abort"),
            FailurePolicy::SubstituteOriginal => write!(f, "substitute-original"),
        }
    }
}

/// Terminal state of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    /// Edited and regenerated
    Generated,
    /// Original clip used in place of a failed generation
    Substituted,
    /// No usable clip
    Failed,
}

impl std::fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentStatus::Generated => write!(f, "generated"),
            SegmentStatus::Substituted => write!(f, "substituted"),
            SegmentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-segment stage that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStage {
    FrameEdit,
    Generation,
    Substitution,
    /// The run was cancelled or aborted before the segment finished
    Cancelled,
}

impl std::fmt::Display for SegmentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentStage::FrameEdit => write!(f, "frame_edit"),
            SegmentStage::Generation => write!(f, "generation"),
            SegmentStage::Substitution => write!(f, "substitution"),
            SegmentStage::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a segment did not get a generated clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFailure {
    pub stage: SegmentStage,
    pub message: String,
    /// Collaborator attempts spent before giving up
    pub attempts: u32,
}

/// Per-segment entry of the run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentReport {
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub status: SegmentStatus,
    /// Total collaborator attempts for the segment
    pub attempts: u32,
    /// Fallback applied after a failure
    pub fallback: Option<FailurePolicy>,
    pub failure: Option<SegmentFailure>,
    /// Clip used at this position in the timeline
    pub clip: Option<PathBuf>,
}

impl SegmentReport {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Whole-run stage names, used when a cross-cutting step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Probe,
    Segmentation,
    TextExtraction,
    TextRemoval,
    PersonRegistry,
    IdentityReferences,
    SegmentProcessing,
    Reassembly,
    TextReintegration,
    Output,
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStage::Probe => "probe",
            RunStage::Segmentation => "segmentation",
            RunStage::TextExtraction => "text_extraction",
            RunStage::TextRemoval => "text_removal",
            RunStage::PersonRegistry => "person_registry",
            RunStage::IdentityReferences => "identity_references",
            RunStage::SegmentProcessing => "segment_processing",
            RunStage::Reassembly => "reassembly",
            RunStage::TextReintegration => "text_reintegration",
            RunStage::Output => "output",
        };
        write!(f, "{}", name)
    }
}

/// Why a run returned the source unmodified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassthroughReason {
    NoPersonDetected,
}

/// Final outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Localized video written
    Completed { output: PathBuf },
    /// Source copied unmodified
    Passthrough {
        reason: PassthroughReason,
        output: PathBuf,
    },
    /// A stage failed; see the segment list for per-segment causes
    Failed { stage: RunStage, message: String },
    /// Cancelled by the caller
    Cancelled,
}

/// Whether a text overlay was preserved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TextLayerMode {
    /// Overlay extracted and reintegrated
    Present { region: Region, pixel_count: usize },
    /// No overlay; reintegration skipped
    Absent { reason: String },
    /// Run ended before extraction
    NotAttempted,
}

/// Structured result of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub source: PathBuf,
    pub theme: TransformationTheme,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Source duration in seconds
    pub source_duration: f64,
    pub outcome: RunOutcome,
    pub text_layer: TextLayerMode,
    pub person_count: usize,
    pub segments: Vec<SegmentReport>,
}

impl RunReport {
    /// Completed or pass-through
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            RunOutcome::Completed { .. } | RunOutcome::Passthrough { .. }
        )
    }

    /// Output path, when a video was produced
    pub fn output(&self) -> Option<&PathBuf> {
        match &self.outcome {
            RunOutcome::Completed { output } | RunOutcome::Passthrough { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn segments_with_status(&self, status: SegmentStatus) -> Vec<usize> {
        self.segments
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.index)
            .collect()
    }
}
