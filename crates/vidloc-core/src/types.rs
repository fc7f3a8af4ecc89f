//! Shared types

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable identifier of one person within a run (`person_001`, `person_002`, ...)
///
/// Zero-padded so sorted order is first-appearance order.
pub type PersonId = String;

/// Half-open frame range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSpan {
    /// First frame index (inclusive)
    pub start: u64,
    /// End frame index (exclusive)
    pub end: u64,
}

impl FrameSpan {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of frames in the span
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, frame: u64) -> bool {
        frame >= self.start && frame < self.end
    }

    /// Index of the last frame in the span
    pub fn last(&self) -> u64 {
        self.end.saturating_sub(1).max(self.start)
    }
}

/// Target frame rate and resolution for a clip
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipFormat {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Exact output frame count; the clip is stretched over it when set
    #[serde(default)]
    pub frames: Option<u64>,
}

impl ClipFormat {
    /// Same format, stretched to exactly `frames` frames
    pub fn with_frames(self, frames: u64) -> Self {
        Self {
            frames: Some(frames),
            ..self
        }
    }
}

/// Video stream information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    /// File (or image sequence directory) path
    pub path: PathBuf,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: f64,
    /// Total number of decodable frames
    pub frame_count: u64,
    /// Whether the container carries an audio stream
    pub has_audio: bool,
}

impl VideoInfo {
    /// Duration in seconds, derived from the frame count
    pub fn duration(&self) -> f64 {
        if self.fps > 0.0 {
            self.frame_count as f64 / self.fps
        } else {
            0.0
        }
    }

    /// Length of one frame in seconds
    pub fn frame_interval(&self) -> f64 {
        if self.fps > 0.0 {
            1.0 / self.fps
        } else {
            0.0
        }
    }

    /// Timestamp of a frame index in seconds
    pub fn time_of(&self, frame: u64) -> f64 {
        if self.fps > 0.0 {
            frame as f64 / self.fps
        } else {
            0.0
        }
    }

    /// Span covering every frame
    pub fn span(&self) -> FrameSpan {
        FrameSpan::new(0, self.frame_count)
    }

    pub fn format(&self) -> ClipFormat {
        ClipFormat {
            fps: self.fps,
            width: self.width,
            height: self.height,
            frames: None,
        }
    }
}

/// Which boundary frame of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Start,
    End,
}

impl Boundary {
    pub const ALL: [Boundary; 2] = [Boundary::Start, Boundary::End];
}

impl std::fmt::Display for Boundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Boundary::Start => write!(f, "start"),
            Boundary::End => write!(f, "end"),
        }
    }
}

/// A single frame written to disk as a raster image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameImage {
    /// Index of the frame in the source video
    pub frame_index: u64,
    /// PNG file holding the frame
    pub path: PathBuf,
}

/// A contiguous time slice of the source video, edited and generated as one unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// Position in the timeline (0-based)
    pub index: usize,
    /// Source frames covered by the segment
    pub span: FrameSpan,
    /// Source frame rate
    pub fps: f64,
    /// First frame of the segment
    pub start_frame: FrameImage,
    /// Last frame of the segment
    pub end_frame: FrameImage,
}

impl Segment {
    /// Start time in seconds
    pub fn start_time(&self) -> f64 {
        self.span.start as f64 / self.fps
    }

    /// End time in seconds
    pub fn end_time(&self) -> f64 {
        self.span.end as f64 / self.fps
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.span.len() as f64 / self.fps
    }

    pub fn frame_count(&self) -> u64 {
        self.span.len()
    }

    /// Boundary frame for the given side
    pub fn boundary(&self, boundary: Boundary) -> &FrameImage {
        match boundary {
            Boundary::Start => &self.start_frame,
            Boundary::End => &self.end_frame,
        }
    }
}

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Exclusive right edge
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Center point
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Grow by `pad` pixels on every side, clamped to the frame
    pub fn padded(&self, pad: u32, frame_width: u32, frame_height: u32) -> Region {
        let x = self.x.saturating_sub(pad);
        let y = self.y.saturating_sub(pad);
        let right = (self.right() + pad).min(frame_width);
        let bottom = (self.bottom() + pad).min(frame_height);
        Region::new(x, y, right.saturating_sub(x), bottom.saturating_sub(y))
    }

    /// Intersection over union
    pub fn iou(&self, other: &Region) -> f64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) as f64 * (y2 - y1) as f64;
        let union = self.area() as f64 + other.area() as f64 - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Output aspect ratio understood by generation models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "9:16")]
    Portrait9x16,
    #[serde(rename = "16:9")]
    Landscape16x9,
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "4:5")]
    Portrait4x5,
    #[serde(rename = "4:3")]
    Landscape4x3,
    #[serde(rename = "3:4")]
    Portrait3x4,
}

impl AspectRatio {
    const ALL: [AspectRatio; 6] = [
        AspectRatio::Portrait9x16,
        AspectRatio::Landscape16x9,
        AspectRatio::Square,
        AspectRatio::Portrait4x5,
        AspectRatio::Landscape4x3,
        AspectRatio::Portrait3x4,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Portrait9x16 => "9:16",
            AspectRatio::Landscape16x9 => "16:9",
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait4x5 => "4:5",
            AspectRatio::Landscape4x3 => "4:3",
            AspectRatio::Portrait3x4 => "3:4",
        }
    }

    fn ratio(&self) -> f64 {
        match self {
            AspectRatio::Portrait9x16 => 9.0 / 16.0,
            AspectRatio::Landscape16x9 => 16.0 / 9.0,
            AspectRatio::Square => 1.0,
            AspectRatio::Portrait4x5 => 4.0 / 5.0,
            AspectRatio::Landscape4x3 => 4.0 / 3.0,
            AspectRatio::Portrait3x4 => 3.0 / 4.0,
        }
    }

    /// Closest supported ratio for a frame size
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        if width == 0 || height == 0 {
            return AspectRatio::Portrait9x16;
        }
        let target = (width as f64 / height as f64).ln();
        let mut best = AspectRatio::Portrait9x16;
        let mut best_distance = f64::MAX;
        for candidate in Self::ALL {
            let distance = (candidate.ratio().ln() - target).abs();
            if distance < best_distance {
                best = candidate;
                best_distance = distance;
            }
        }
        best
    }
}

impl std::fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Visual attributes of a person
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Appearance {
    pub gender: String,
    pub age: String,
    pub skin: String,
    pub hair: String,
    pub clothing: String,
}

impl Appearance {
    /// Short natural-language description, e.g. "30s woman with light skin tone with short black hair"
    pub fn description(&self) -> String {
        let mut parts = Vec::new();
        if !self.age.is_empty() {
            parts.push(self.age.clone());
        }
        if !self.gender.is_empty() {
            parts.push(self.gender.clone());
        }
        if !self.skin.is_empty() {
            parts.push(format!("with {} skin tone", self.skin));
        }
        if !self.hair.is_empty() {
            parts.push(format!("with {}", self.hair));
        }

        if parts.is_empty() {
            "person".to_string()
        } else {
            parts.join(" ")
        }
    }
}

/// One person instance reported by the perception collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPerson {
    /// Bounding region in pixels
    pub region: Region,
    /// Appearance attributes
    pub appearance: Appearance,
}

/// Where a registered person was observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub segment_index: usize,
    pub boundary: Boundary,
    pub frame_index: u64,
    pub region: Region,
}

/// Identity-independent description of one individual in the source footage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRecord {
    /// Stable identifier, unique within a run
    pub person_id: PersonId,
    /// Consolidated appearance attributes
    pub appearance: Appearance,
    /// Free-form appearance description
    pub description: String,
    /// Free-form position description
    pub position: String,
    /// Every boundary frame the person appears in, in time order
    pub sightings: Vec<Sighting>,
}

impl PersonRecord {
    /// Sighting at a segment boundary, if the person is visible there
    pub fn sighting_at(&self, segment_index: usize, boundary: Boundary) -> Option<&Sighting> {
        self.sightings
            .iter()
            .find(|s| s.segment_index == segment_index && s.boundary == boundary)
    }

    /// Segments the person appears in (sorted, unique)
    pub fn segments(&self) -> Vec<usize> {
        let mut segments: Vec<usize> = self.sightings.iter().map(|s| s.segment_index).collect();
        segments.sort_unstable();
        segments.dedup();
        segments
    }
}

/// Target demographic description driving the localization
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformationTheme(String);

impl TransformationTheme {
    pub fn new(theme: impl Into<String>) -> Self {
        Self(theme.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransformationTheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replacement persona designed for one original person
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    /// Appearance of the replacement person
    pub appearance: Appearance,
    /// Casting notes (face, build, expression)
    #[serde(default)]
    pub casting_notes: String,
}

/// Replacement identity anchoring every edit of one person
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityReference {
    /// Person being replaced
    pub person_id: PersonId,
    /// Theme the persona was designed for
    pub theme: TransformationTheme,
    /// Designed persona
    pub persona: Persona,
    /// Casting description used to render the portraits
    pub casting_description: String,
    /// Reference portraits, first one frontal
    pub portraits: Vec<PathBuf>,
}

/// Edit result for one segment boundary frame
#[derive(Debug, Clone)]
pub struct EditedFrame {
    pub segment_index: usize,
    pub boundary: Boundary,
    /// Source frame index the edit was derived from
    pub source_frame_index: u64,
    /// Edited image
    pub path: PathBuf,
    /// Identities applied to the frame
    pub identities: Vec<Arc<IdentityReference>>,
    /// Collaborator attempts used (0 for pass-through frames)
    pub attempts: u32,
}

impl EditedFrame {
    pub fn person_ids(&self) -> Vec<&str> {
        self.identities.iter().map(|i| i.person_id.as_str()).collect()
    }

    /// Whether the frame was copied unchanged because no person is visible
    pub fn is_passthrough(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Video generated for one segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSegment {
    pub segment_index: usize,
    /// Clip conformed to source frame rate and resolution
    pub clip: PathBuf,
    /// Measured duration in seconds
    pub duration: f64,
    /// Collaborator attempts used
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appearance_description() {
        let appearance = Appearance {
            gender: "woman".to_string(),
            age: "30s".to_string(),
            skin: "light".to_string(),
            hair: "short black hair".to_string(),
            clothing: "red jacket".to_string(),
        };
        assert_eq!(
            appearance.description(),
            "30s woman with light skin tone with short black hair"
        );
        assert_eq!(Appearance::default().description(), "person");
    }

    #[test]
    fn test_region_iou() {
        let a = Region::new(0, 0, 10, 10);
        let b = Region::new(5, 0, 10, 10);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-9);
        assert_eq!(a.iou(&Region::new(20, 20, 5, 5)), 0.0);
    }

    #[test]
    fn test_region_padded_is_clamped() {
        let region = Region::new(2, 3, 10, 10).padded(5, 14, 100);
        assert_eq!(region, Region::new(0, 0, 14, 18));
    }

    #[test]
    fn test_aspect_ratio_from_dimensions() {
        assert_eq!(AspectRatio::from_dimensions(1080, 1920), AspectRatio::Portrait9x16);
        assert_eq!(AspectRatio::from_dimensions(1920, 1080), AspectRatio::Landscape16x9);
        assert_eq!(AspectRatio::from_dimensions(1000, 1010), AspectRatio::Square);
        assert_eq!(AspectRatio::from_dimensions(1080, 1350), AspectRatio::Portrait4x5);
    }

    #[test]
    fn test_frame_span() {
        let span = FrameSpan::new(10, 20);
        assert_eq!(span.len(), 10);
        assert_eq!(span.last(), 19);
        assert!(span.contains(10));
        assert!(!span.contains(20));
    }
}
