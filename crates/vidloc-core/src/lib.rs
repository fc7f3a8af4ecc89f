//! vidloc-core - video localization core library
//!
//! Media access, segmentation, text layer extraction and reintegration,
//! reassembly and run reports.

pub mod exporter;
pub mod imaging;
pub mod media;
pub mod reassembler;
pub mod reintegrator;
pub mod report;
pub mod retry;
pub mod segmenter;
pub mod shots;
pub mod text_layer;
pub mod types;

pub use exporter::{ExportError, Exporter, MarkerFormat};
pub use media::{FfmpegBackend, ImageSequenceBackend, MediaBackend, MediaError};
pub use reassembler::{ClipOrigin, Reassembler, ReassemblyError, Timeline, TimelineEntry};
pub use reintegrator::{ReintegrationError, TextReintegrator};
pub use report::*;
pub use retry::{retry_with_backoff, RetryOutcome, RetryPolicy};
pub use segmenter::{SegmentationError, SegmentationPolicy, Segmenter, SegmenterConfig};
pub use shots::ShotDetector;
pub use text_layer::{
    extract_text_layer, inpaint, CompositeError, TextExtractionError, TextLayer, TextLayerConfig,
};
pub use types::*;
