//! Static text overlay extraction
//!
//! A burned-in caption is the part of the frame whose edges persist and whose
//! luminance never changes while everything behind it moves. Statistics are
//! accumulated over an even sample of frames, each first aligned to the first
//! sample by a global translation so that whole-frame jitter does not smear the
//! overlay. The surviving pixels are stored with their median color in an RGBA
//! layer whose alpha channel is the mask.

use std::borrow::Cow;
use std::path::Path;

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::imaging::{blur3, median_u8, sobel_magnitude, to_gray, translate, Mask, ShiftEstimator};
use crate::media::{load_rgba, sample_indices, save_png, MediaBackend, MediaError};
use crate::types::{FrameSpan, Region, VideoInfo};

/// Pixels around the mask that are also repainted by [`inpaint`]
const INPAINT_GROW: u32 = 2;

/// Text layer extraction errors
#[derive(Error, Debug)]
pub enum TextExtractionError {
    /// Not enough frames to tell static from moving content
    #[error("Too few frames for text extraction: found {found}, need {required}")]
    TooFewFrames { found: usize, required: usize },

    /// Nothing in the video qualifies as a static overlay
    #[error("No static text overlay detected")]
    NoStaticOverlay,

    /// Frame size differs from the first sample
    #[error("Frame size {found:?} differs from {expected:?}")]
    FrameSizeMismatch {
        expected: (u32, u32),
        found: (u32, u32),
    },

    /// Frame access failed
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Layer image could not be encoded or decoded
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task failed
    #[error("Extraction task failed: {0}")]
    TaskFailed(String),
}

/// Compositing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompositeError {
    /// Layer and frame sizes differ
    #[error("Layer is {layer:?} but frame is {frame:?}")]
    DimensionMismatch { layer: (u32, u32), frame: (u32, u32) },
}

/// Extraction thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextLayerConfig {
    /// Upper bound on sampled frames
    pub max_samples: usize,
    /// Lower bound on sampled frames
    pub min_samples: usize,
    /// Normalized edge magnitude (0-255) counted as an edge hit
    pub edge_tau: f32,
    /// Minimum fraction of samples in which a seed pixel is an edge
    pub persist_quantile: f32,
    /// Minimum persistence weighted by edge stability
    pub score_min: f32,
    /// Maximum luminance standard deviation of a static pixel
    pub gray_std_max: f32,
    /// Static pixels within this distance of a seed join the mask
    pub seed_distance: u32,
    /// Smallest kept mask component in pixels
    pub min_component_area: usize,
    /// Largest kept mask component as a fraction of the frame
    pub max_component_area_frac: f64,
    /// Frames kept for the per-pixel color median
    pub median_samples: usize,
    /// Largest frame translation searched during alignment; 0 disables alignment
    pub align_max_shift: u32,
    /// Side of the square patches matched during alignment
    pub align_patch_size: u32,
    /// Most textured reference patches used for alignment
    pub align_max_patches: usize,
    /// Share of patches that must agree on a translation
    pub align_min_consensus: f32,
}

impl Default for TextLayerConfig {
    fn default() -> Self {
        Self {
            max_samples: 240,
            min_samples: 3,
            edge_tau: 60.0,
            persist_quantile: 0.65,
            score_min: 0.15,
            gray_std_max: 6.0,
            seed_distance: 3,
            min_component_area: 80,
            max_component_area_frac: 0.06,
            median_samples: 15,
            align_max_shift: 6,
            align_patch_size: 16,
            align_max_patches: 64,
            align_min_consensus: 0.5,
        }
    }
}

/// Extracted overlay: RGBA pixels with alpha 255 exactly on the mask
///
/// The layer is immutable once built; compositing only reads it.
#[derive(Debug, Clone)]
pub struct TextLayer {
    pixels: RgbaImage,
    region: Region,
    active: FrameSpan,
    pixel_count: usize,
}

impl TextLayer {
    /// Wrap an RGBA image whose non-zero alpha marks the overlay
    pub fn from_rgba(pixels: RgbaImage, active: FrameSpan) -> Result<Self, TextExtractionError> {
        let (width, height) = pixels.dimensions();
        let mask = Mask::from_fn(width, height, |i| pixels.as_raw()[i * 4 + 3] > 0);
        let region = mask.bounding_region().ok_or(TextExtractionError::NoStaticOverlay)?;
        let pixel_count = mask.count();

        Ok(Self {
            pixels,
            region,
            active,
            pixel_count,
        })
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    /// Bounding box of the mask
    pub fn region(&self) -> Region {
        self.region
    }

    /// Frames on which the overlay is shown
    pub fn active(&self) -> FrameSpan {
        self.active
    }

    pub fn pixel_count(&self) -> usize {
        self.pixel_count
    }

    pub fn is_masked(&self, x: u32, y: u32) -> bool {
        x < self.pixels.width() && y < self.pixels.height() && self.pixels.get_pixel(x, y)[3] > 0
    }

    pub fn mask(&self) -> Mask {
        let (width, height) = self.pixels.dimensions();
        Mask::from_fn(width, height, |i| self.pixels.as_raw()[i * 4 + 3] > 0)
    }

    fn check_dimensions(&self, frame: &RgbaImage) -> Result<(), CompositeError> {
        if frame.dimensions() != self.pixels.dimensions() {
            return Err(CompositeError::DimensionMismatch {
                layer: self.pixels.dimensions(),
                frame: frame.dimensions(),
            });
        }
        Ok(())
    }

    /// Overwrite the masked pixels of `frame` with the layer, ignoring what was there
    pub fn composite(&self, frame: &mut RgbaImage) -> Result<(), CompositeError> {
        self.check_dimensions(frame)?;

        for y in self.region.y..self.region.bottom() {
            for x in self.region.x..self.region.right() {
                let layer = self.pixels.get_pixel(x, y);
                if layer[3] > 0 {
                    frame.put_pixel(x, y, Rgba([layer[0], layer[1], layer[2], 255]));
                }
            }
        }
        Ok(())
    }

    /// Store as a transparent PNG
    pub async fn save(&self, path: &Path) -> Result<(), TextExtractionError> {
        save_png(self.pixels.clone(), path).await?;
        Ok(())
    }

    /// Load a layer written by [`TextLayer::save`]
    pub async fn load(path: &Path, active: FrameSpan) -> Result<Self, TextExtractionError> {
        let pixels = load_rgba(path).await?;
        Self::from_rgba(pixels, active)
    }
}

/// Streaming per-pixel statistics over sampled frames
pub struct LayerAccumulator {
    config: TextLayerConfig,
    width: u32,
    height: u32,
    samples: usize,
    gray_sum: Vec<f64>,
    gray_sq_sum: Vec<f64>,
    edge_hits: Vec<u32>,
    mag_sum: Vec<f64>,
    mag_sq_sum: Vec<f64>,
    reservoir: Vec<RgbaImage>,
    reservoir_every: usize,
    /// Built from the first sample
    aligner: Option<ShiftEstimator>,
    aligned: usize,
}

impl LayerAccumulator {
    pub fn new(width: u32, height: u32, expected_samples: usize, config: TextLayerConfig) -> Self {
        let len = width as usize * height as usize;
        let reservoir_every = (expected_samples / config.median_samples.max(1)).max(1);
        Self {
            config,
            width,
            height,
            samples: 0,
            gray_sum: vec![0.0; len],
            gray_sq_sum: vec![0.0; len],
            edge_hits: vec![0; len],
            mag_sum: vec![0.0; len],
            mag_sq_sum: vec![0.0; len],
            reservoir: Vec::new(),
            reservoir_every,
            aligner: None,
            aligned: 0,
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Samples that were moved onto the first one
    pub fn aligned(&self) -> usize {
        self.aligned
    }

    /// Translate `frame` onto the first sample when the patches agree on a shift
    fn align(&mut self, frame: &RgbaImage, gray: &[f32]) -> Option<(RgbaImage, Vec<f32>)> {
        let (dx, dy) = self.aligner.as_ref()?.estimate(gray)?;
        if (dx, dy) == (0, 0) {
            return None;
        }
        self.aligned += 1;
        let moved = translate(frame, dx, dy);
        let gray = to_gray(&moved);
        Some((moved, gray))
    }

    /// Fold one frame into the statistics
    pub fn push(&mut self, frame: &RgbaImage) -> Result<(), TextExtractionError> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(TextExtractionError::FrameSizeMismatch {
                expected: (self.width, self.height),
                found: frame.dimensions(),
            });
        }

        let gray = to_gray(frame);
        let (frame, gray) = match self.align(frame, &gray) {
            Some((moved, gray)) => (Cow::Owned(moved), gray),
            None => (Cow::Borrowed(frame), gray),
        };
        let magnitude = sobel_magnitude(&blur3(&gray, self.width, self.height), self.width, self.height);
        let max = magnitude.iter().cloned().fold(0.0f32, f32::max);
        let scale = if max > 0.0 { 255.0 / max } else { 0.0 };

        for i in 0..gray.len() {
            let g = gray[i] as f64;
            self.gray_sum[i] += g;
            self.gray_sq_sum[i] += g * g;

            let m = magnitude[i] * scale;
            if m >= self.config.edge_tau {
                self.edge_hits[i] += 1;
            }
            self.mag_sum[i] += m as f64;
            self.mag_sq_sum[i] += (m as f64) * (m as f64);
        }

        if self.samples % self.reservoir_every == 0 && self.reservoir.len() < self.config.median_samples {
            self.reservoir.push(frame.into_owned());
        }
        if self.samples == 0 && self.config.align_max_shift > 0 {
            self.aligner = Some(ShiftEstimator::new(
                &gray,
                self.width,
                self.height,
                self.config.align_max_shift,
                self.config.align_patch_size,
                self.config.align_max_patches,
                self.config.align_min_consensus,
            ));
        }
        self.samples += 1;
        Ok(())
    }

    /// Compute the mask and median colors
    pub fn finish(self, active: FrameSpan) -> Result<TextLayer, TextExtractionError> {
        if self.samples < self.config.min_samples {
            return Err(TextExtractionError::TooFewFrames {
                found: self.samples,
                required: self.config.min_samples,
            });
        }

        let n = self.samples as f64;
        let len = self.gray_sum.len();

        let frequency: Vec<f64> = self.edge_hits.iter().map(|&h| h as f64 / n).collect();
        let mag_var: Vec<f64> = (0..len)
            .map(|i| {
                let mean = self.mag_sum[i] / n;
                (self.mag_sq_sum[i] / n - mean * mean).max(0.0)
            })
            .collect();
        let max_var = mag_var.iter().cloned().fold(0.0f64, f64::max) + 1e-6;

        let persist = self.config.persist_quantile as f64;
        let score_min = self.config.score_min as f64;
        let seeds = Mask::from_fn(self.width, self.height, |i| {
            frequency[i] >= persist && frequency[i] * (1.0 - mag_var[i] / max_var) >= score_min
        })
        .open()
        .close();

        let std_max = self.config.gray_std_max as f64;
        let still = Mask::from_fn(self.width, self.height, |i| {
            let mean = self.gray_sum[i] / n;
            let var = (self.gray_sq_sum[i] / n - mean * mean).max(0.0);
            var.sqrt() <= std_max
        })
        .close();

        let max_area = (self.config.max_component_area_frac * len as f64) as usize;
        let mask = still
            .and(&seeds.dilate_disk(self.config.seed_distance))
            .filter_components(self.config.min_component_area, max_area);

        debug!("Aligned {} of {} samples before accumulating", self.aligned, self.samples);
        debug!(
            "Text mask: {} seed pixels, {} static pixels, {} kept",
            seeds.count(),
            still.count(),
            mask.count()
        );

        if mask.count() == 0 {
            return Err(TextExtractionError::NoStaticOverlay);
        }

        let mut pixels = RgbaImage::new(self.width, self.height);
        let mut channel = Vec::with_capacity(self.reservoir.len());
        for y in 0..self.height {
            for x in 0..self.width {
                if !mask.get(x, y) {
                    continue;
                }
                let mut color = [0u8, 0, 0, 255];
                for (c, value) in color.iter_mut().take(3).enumerate() {
                    channel.clear();
                    channel.extend(self.reservoir.iter().map(|frame| frame.get_pixel(x, y)[c]));
                    *value = median_u8(&mut channel);
                }
                pixels.put_pixel(x, y, Rgba(color));
            }
        }

        TextLayer::from_rgba(pixels, active)
    }
}

/// Extract the static overlay of a video
pub async fn extract_text_layer<M: MediaBackend>(
    media: &M,
    info: &VideoInfo,
    config: &TextLayerConfig,
) -> Result<TextLayer, TextExtractionError> {
    let indices = sample_indices(info.frame_count, config.max_samples);
    if indices.len() < config.min_samples {
        return Err(TextExtractionError::TooFewFrames {
            found: indices.len(),
            required: config.min_samples,
        });
    }

    info!(
        "Extracting text layer from {} sampled frames of {}",
        indices.len(),
        info.path.display()
    );

    let mut accumulator = LayerAccumulator::new(info.width, info.height, indices.len(), config.clone());
    media
        .scan_frames(&info.path, &indices, &mut |_, frame| {
            accumulator
                .push(&frame)
                .map_err(|e| MediaError::Unsupported(e.to_string()))
        })
        .await?;

    let active = info.span();
    let layer = tokio::task::spawn_blocking(move || accumulator.finish(active))
        .await
        .map_err(|e| TextExtractionError::TaskFailed(e.to_string()))??;

    info!(
        "Text layer found: {} pixels in {}x{} at ({}, {})",
        layer.pixel_count(),
        layer.region().width,
        layer.region().height,
        layer.region().x,
        layer.region().y
    );
    Ok(layer)
}

/// Fill the masked pixels (and a small margin) from the surrounding content
///
/// Holes are filled from the outside in: every pass assigns each hole pixel
/// that touches known pixels the mean of those neighbors.
pub fn inpaint(frame: &RgbaImage, layer: &TextLayer) -> Result<RgbaImage, CompositeError> {
    layer.check_dimensions(frame)?;

    let (width, height) = frame.dimensions();
    let holes = layer.mask().dilate(INPAINT_GROW);
    let area = layer.region().padded(INPAINT_GROW + 1, width, height);

    let mut output = frame.clone();
    let mut known: Vec<bool> = (0..width as usize * height as usize)
        .map(|i| !holes.get((i % width as usize) as u32, (i / width as usize) as u32))
        .collect();

    let mut remaining = holes.count();
    while remaining > 0 {
        let mut filled = Vec::new();
        for y in area.y..area.bottom() {
            for x in area.x..area.right() {
                if known[(y * width + x) as usize] {
                    continue;
                }
                let mut sum = [0u32; 3];
                let mut count = 0u32;
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                        if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                            continue;
                        }
                        if known[(ny as u32 * width + nx as u32) as usize] {
                            let p = output.get_pixel(nx as u32, ny as u32);
                            for c in 0..3 {
                                sum[c] += p[c] as u32;
                            }
                            count += 1;
                        }
                    }
                }
                if count > 0 {
                    let color = Rgba([
                        (sum[0] / count) as u8,
                        (sum[1] / count) as u8,
                        (sum[2] / count) as u8,
                        255,
                    ]);
                    filled.push((x, y, color));
                }
            }
        }

        // Whole frame masked: nothing to fill from
        if filled.is_empty() {
            break;
        }

        remaining -= filled.len();
        for (x, y, color) in filled {
            output.put_pixel(x, y, color);
            known[(y * width + x) as usize] = true;
        }
    }

    Ok(output)
}
