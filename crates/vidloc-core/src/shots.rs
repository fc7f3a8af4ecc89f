//! Shot boundary detection using color histogram comparison
//!
//! Consecutive sampled frames are compared by the chi-squared distance of
//! their HSV histograms; a distance above the threshold marks a hard cut.

use image::imageops::FilterType;
use image::RgbaImage;
use tracing::debug;

/// Width frames are downscaled to before histogramming
const HISTOGRAM_WIDTH: u32 = 160;

/// Shot boundary detector
#[derive(Debug, Clone)]
pub struct ShotDetector {
    /// Normalized chi-squared distance above which a cut is reported (0.0 - 1.0)
    threshold: f64,
    /// Minimum number of samples between two cuts
    min_shot_samples: usize,
    /// Histogram bins per HSV channel
    histogram_bins: usize,
}

impl Default for ShotDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ShotDetector {
    pub fn new() -> Self {
        Self {
            threshold: 0.3,
            min_shot_samples: 1,
            histogram_bins: 16,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Ignore cuts closer than this many samples to the previous one
    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_shot_samples = min_samples.max(1);
        self
    }

    /// Sample positions at which a new shot starts (position 0 excluded)
    pub fn detect_cuts(&self, histograms: &[Vec<f64>]) -> Vec<usize> {
        let mut cuts = Vec::new();
        let mut last_boundary = 0usize;

        for i in 1..histograms.len() {
            let distance = chi_squared_distance(&histograms[i - 1], &histograms[i]);
            if distance <= self.threshold {
                continue;
            }

            if i - last_boundary >= self.min_shot_samples {
                debug!(
                    "Shot boundary at sample {} (distance={:.3}, threshold={:.3})",
                    i, distance, self.threshold
                );
                cuts.push(i);
                last_boundary = i;
            } else {
                debug!(
                    "Ignoring boundary at sample {} ({} samples after previous)",
                    i,
                    i - last_boundary
                );
            }
        }

        cuts
    }

    /// Per-channel HSV histogram, each channel normalized to sum 1
    pub fn compute_histogram(&self, frame: &RgbaImage) -> Vec<f64> {
        let bins = self.histogram_bins;
        let mut histogram = vec![0.0f64; bins * 3];

        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return histogram;
        }

        let small;
        let frame = if width > HISTOGRAM_WIDTH {
            let h = ((height as u64 * HISTOGRAM_WIDTH as u64) / width as u64).max(1) as u32;
            small = image::imageops::resize(frame, HISTOGRAM_WIDTH, h, FilterType::Nearest);
            &small
        } else {
            frame
        };

        let mut total = 0.0;
        for pixel in frame.pixels() {
            let (h, s, v) = rgb_to_hsv(pixel[0], pixel[1], pixel[2]);
            let h_bin = ((h / 360.0) * bins as f64).min(bins as f64 - 1.0) as usize;
            let s_bin = (s * bins as f64).min(bins as f64 - 1.0) as usize;
            let v_bin = (v * bins as f64).min(bins as f64 - 1.0) as usize;
            histogram[h_bin] += 1.0;
            histogram[bins + s_bin] += 1.0;
            histogram[2 * bins + v_bin] += 1.0;
            total += 1.0;
        }

        for value in &mut histogram {
            *value /= total;
        }
        histogram
    }
}

/// Chi-squared distance normalized to 0.0 - 1.0 for three-channel histograms
fn chi_squared_distance(h1: &[f64], h2: &[f64]) -> f64 {
    const EPSILON: f64 = 1e-10;

    if h1.len() != h2.len() {
        return f64::MAX;
    }

    let mut distance = 0.0;
    for (a, b) in h1.iter().zip(h2.iter()) {
        let diff = a - b;
        distance += (diff * diff) / (a + b + EPSILON);
    }

    // Each channel contributes at most 2
    distance / 6.0
}

/// RGB (0-255) to HSV (hue in degrees, saturation and value in 0.0 - 1.0)
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let r = r as f64 / 255.0;
    let g = g as f64 / 255.0;
    let b = b as f64 / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * (((b - r) / delta) + 2.0)
    } else {
        60.0 * (((r - g) / delta) + 4.0)
    };

    let s = if max == 0.0 { 0.0 } else { delta / max };

    (h, s, max)
}
