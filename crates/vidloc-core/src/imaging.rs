//! Pixel helpers: grayscale, gradients and binary masks

use std::collections::VecDeque;

use image::RgbaImage;

use crate::types::Region;

/// BT.601 luma of every pixel, row-major
pub fn to_gray(frame: &RgbaImage) -> Vec<f32> {
    frame
        .pixels()
        .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
        .collect()
}

fn at(values: &[f32], width: usize, height: usize, x: isize, y: isize) -> f32 {
    let x = x.clamp(0, width as isize - 1) as usize;
    let y = y.clamp(0, height as isize - 1) as usize;
    values[y * width + x]
}

/// 3x3 box blur with replicated borders
pub fn blur3(values: &[f32], width: u32, height: u32) -> Vec<f32> {
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0.0; values.len()];
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0.0;
            for dy in -1..=1isize {
                for dx in -1..=1isize {
                    sum += at(values, w, h, x as isize + dx, y as isize + dy);
                }
            }
            out[y * w + x] = sum / 9.0;
        }
    }
    out
}

/// Sobel gradient magnitude with replicated borders
pub fn sobel_magnitude(values: &[f32], width: u32, height: u32) -> Vec<f32> {
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0.0; values.len()];
    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as isize, y as isize);
            let p = |dx: isize, dy: isize| at(values, w, h, xi + dx, yi + dy);
            let gx = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
            let gy = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
            out[y * w + x] = (gx * gx + gy * gy).sqrt();
        }
    }
    out
}

/// Row-major binary mask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<bool>,
}

impl Mask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![false; width as usize * height as usize],
        }
    }

    /// Build from a per-pixel predicate over row-major indices
    pub fn from_fn(width: u32, height: u32, f: impl Fn(usize) -> bool) -> Self {
        let len = width as usize * height as usize;
        Self {
            width,
            height,
            data: (0..len).map(f).collect(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        let index = y as usize * self.width as usize + x as usize;
        self.data[index] = value;
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    pub fn and(&self, other: &Mask) -> Mask {
        Mask {
            width: self.width,
            height: self.height,
            data: self.data.iter().zip(&other.data).map(|(a, b)| *a && *b).collect(),
        }
    }

    /// Morphology over the given neighborhood offsets; `any` = dilate, otherwise erode
    fn morph(&self, offsets: &[(i32, i32)], any: bool) -> Mask {
        let (w, h) = (self.width as i32, self.height as i32);
        let mut out = Mask::new(self.width, self.height);
        for y in 0..h {
            for x in 0..w {
                let mut hit = !any;
                for &(dx, dy) in offsets {
                    let (nx, ny) = (x + dx, y + dy);
                    let value = if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        // Outside counts as background for dilation and foreground for erosion
                        !any
                    } else {
                        self.data[(ny * w + nx) as usize]
                    };
                    if any && value {
                        hit = true;
                        break;
                    }
                    if !any && !value {
                        hit = false;
                        break;
                    }
                }
                out.data[(y * w + x) as usize] = hit;
            }
        }
        out
    }

    pub fn dilate(&self, radius: u32) -> Mask {
        self.morph(&square_offsets(radius), true)
    }

    pub fn erode(&self, radius: u32) -> Mask {
        self.morph(&square_offsets(radius), false)
    }

    /// 3x3 opening
    pub fn open(&self) -> Mask {
        self.erode(1).dilate(1)
    }

    /// 3x3 closing
    pub fn close(&self) -> Mask {
        self.dilate(1).erode(1)
    }

    /// Pixels within Euclidean `radius` of any set pixel
    pub fn dilate_disk(&self, radius: u32) -> Mask {
        self.morph(&disk_offsets(radius), true)
    }

    /// Drop 8-connected components outside `[min_area, max_area]`
    pub fn filter_components(&self, min_area: usize, max_area: usize) -> Mask {
        let (w, h) = (self.width as i32, self.height as i32);
        let mut out = Mask::new(self.width, self.height);
        let mut visited = vec![false; self.data.len()];
        let mut queue = VecDeque::new();
        let mut component = Vec::new();

        for start in 0..self.data.len() {
            if !self.data[start] || visited[start] {
                continue;
            }

            component.clear();
            visited[start] = true;
            queue.push_back(start);

            while let Some(index) = queue.pop_front() {
                component.push(index);
                let (x, y) = ((index as i32) % w, (index as i32) / w);
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let (nx, ny) = (x + dx, y + dy);
                        if nx < 0 || ny < 0 || nx >= w || ny >= h {
                            continue;
                        }
                        let neighbor = (ny * w + nx) as usize;
                        if self.data[neighbor] && !visited[neighbor] {
                            visited[neighbor] = true;
                            queue.push_back(neighbor);
                        }
                    }
                }
            }

            if component.len() >= min_area && component.len() <= max_area {
                for &index in &component {
                    out.data[index] = true;
                }
            }
        }

        out
    }

    /// Tight bounding region of the set pixels
    pub fn bounding_region(&self) -> Option<Region> {
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0;
        let mut max_y = 0;
        let mut any = false;

        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    any = true;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        any.then(|| Region::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
    }
}

fn square_offsets(radius: u32) -> Vec<(i32, i32)> {
    let r = radius as i32;
    (-r..=r).flat_map(|dy| (-r..=r).map(move |dx| (dx, dy))).collect()
}

fn disk_offsets(radius: u32) -> Vec<(i32, i32)> {
    let r = radius as i32;
    square_offsets(radius)
        .into_iter()
        .filter(|(dx, dy)| dx * dx + dy * dy <= r * r)
        .collect()
}

/// Copy of `frame` read at an offset: output `(x, y)` is input `(x + dx, y + dy)`, borders replicated
pub fn translate(frame: &RgbaImage, dx: i32, dy: i32) -> RgbaImage {
    let (w, h) = (frame.width() as i32, frame.height() as i32);
    RgbaImage::from_fn(frame.width(), frame.height(), |x, y| {
        let sx = (x as i32 + dx).clamp(0, w - 1) as u32;
        let sy = (y as i32 + dy).clamp(0, h - 1) as u32;
        *frame.get_pixel(sx, sy)
    })
}

/// Reference patches below this luma deviation carry no texture to match
const MIN_PATCH_STD: f32 = 4.0;

struct Patch {
    x: u32,
    y: u32,
    /// Mean-removed reference luma, row-major
    values: Vec<f32>,
}

/// Global translation of frames against a reference frame
///
/// Textured reference patches are block-matched over a small search window
/// with a mean-removed absolute difference, which tolerates brightness
/// changes. Each patch votes for its best displacement; the most common vote
/// is accepted when enough votes agree with it to within one pixel.
pub struct ShiftEstimator {
    width: u32,
    height: u32,
    max_shift: i32,
    patch_size: u32,
    min_consensus: f32,
    patches: Vec<Patch>,
}

impl ShiftEstimator {
    /// Pick up to `max_patches` of the most textured patches of `reference` (luma, row-major)
    pub fn new(
        reference: &[f32],
        width: u32,
        height: u32,
        max_shift: u32,
        patch_size: u32,
        max_patches: usize,
        min_consensus: f32,
    ) -> Self {
        let margin = max_shift;
        let mut scored = Vec::new();
        if patch_size > 0 {
            let mut y = margin;
            while y + patch_size + margin <= height {
                let mut x = margin;
                while x + patch_size + margin <= width {
                    let values = patch_values(reference, width, x, y, patch_size);
                    let variance = values.iter().map(|v| v * v).sum::<f32>() / values.len() as f32;
                    if variance.sqrt() >= MIN_PATCH_STD {
                        scored.push((variance, Patch { x, y, values }));
                    }
                    x += patch_size;
                }
                y += patch_size;
            }
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        let patches = scored.into_iter().take(max_patches).map(|(_, patch)| patch).collect();

        Self {
            width,
            height,
            max_shift: max_shift as i32,
            patch_size,
            min_consensus,
            patches,
        }
    }

    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Offset at which `frame` (luma, row-major) lines up with the reference
    ///
    /// `None` when too few patches agree; `Some((0, 0))` when already aligned.
    pub fn estimate(&self, frame: &[f32]) -> Option<(i32, i32)> {
        if self.patches.len() < 4 || frame.len() != self.width as usize * self.height as usize {
            return None;
        }

        let votes: Vec<(i32, i32)> = self.patches.iter().map(|patch| self.best_offset(patch, frame)).collect();

        // Most common vote, smallest shift on ties; inliers sit within one pixel of it
        let count = |model: (i32, i32)| votes.iter().filter(|&&v| v == model).count();
        let model = votes
            .iter()
            .copied()
            .max_by_key(|&v| (count(v), -(v.0.abs() + v.1.abs())))?;
        let support = votes
            .iter()
            .filter(|v| (v.0 - model.0).abs() <= 1 && (v.1 - model.1).abs() <= 1)
            .count();

        if (support as f32) < self.min_consensus * votes.len() as f32 {
            return None;
        }
        Some(model)
    }

    fn best_offset(&self, patch: &Patch, frame: &[f32]) -> (i32, i32) {
        let mut best = (f32::MAX, 0, (0, 0));
        for dy in -self.max_shift..=self.max_shift {
            for dx in -self.max_shift..=self.max_shift {
                let x = (patch.x as i32 + dx) as u32;
                let y = (patch.y as i32 + dy) as u32;
                let candidate = patch_values(frame, self.width, x, y, self.patch_size);
                let cost: f32 = candidate.iter().zip(&patch.values).map(|(a, b)| (a - b).abs()).sum();
                let magnitude = dx.abs() + dy.abs();
                if cost < best.0 - 1e-3 || ((cost - best.0).abs() <= 1e-3 && magnitude < best.1) {
                    best = (cost, magnitude, (dx, dy));
                }
            }
        }
        best.2
    }
}

/// Mean-removed luma of the `size` x `size` square at `(x, y)`
fn patch_values(values: &[f32], width: u32, x: u32, y: u32, size: u32) -> Vec<f32> {
    let mut patch = Vec::with_capacity((size * size) as usize);
    for row in y..y + size {
        let start = (row * width + x) as usize;
        patch.extend_from_slice(&values[start..start + size as usize]);
    }
    let mean = patch.iter().sum::<f32>() / patch.len().max(1) as f32;
    for value in &mut patch {
        *value -= mean;
    }
    patch
}

/// Middle element after sorting (lower middle for even lengths)
pub fn median_u8(values: &mut [u8]) -> u8 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    values[(values.len() - 1) / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_mask(width: u32, height: u32, set: &[(u32, u32)]) -> Mask {
        let mut mask = Mask::new(width, height);
        for &(x, y) in set {
            mask.set(x, y, true);
        }
        mask
    }

    #[test]
    fn test_open_removes_thin_lines() {
        let line: Vec<(u32, u32)> = (0..10).map(|x| (x, 5)).collect();
        let mask = create_test_mask(10, 10, &line);
        assert_eq!(mask.open().count(), 0);
    }

    #[test]
    fn test_close_fills_single_pixel_hole() {
        let mut block = Vec::new();
        for y in 2..7 {
            for x in 2..7 {
                if (x, y) != (4, 4) {
                    block.push((x, y));
                }
            }
        }
        let closed = create_test_mask(10, 10, &block).close();
        assert!(closed.get(4, 4));
    }

    #[test]
    fn test_dilate_disk_radius() {
        let mask = create_test_mask(9, 9, &[(4, 4)]).dilate_disk(2);
        assert!(mask.get(4, 2));
        assert!(mask.get(5, 5));
        assert!(!mask.get(6, 6));
        assert_eq!(mask.count(), 13);
    }

    #[test]
    fn test_filter_components_by_area() {
        let mut set = vec![(0, 0)];
        for y in 5..8 {
            for x in 5..8 {
                set.push((x, y));
            }
        }
        let filtered = create_test_mask(10, 10, &set).filter_components(4, 20);
        assert!(!filtered.get(0, 0));
        assert_eq!(filtered.count(), 9);
        assert_eq!(filtered.bounding_region(), Some(Region::new(5, 5, 3, 3)));
    }

    #[test]
    fn test_sobel_flat_is_zero() {
        let flat = vec![10.0; 16];
        assert!(sobel_magnitude(&flat, 4, 4).iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_median_u8() {
        assert_eq!(median_u8(&mut [5, 1, 3]), 3);
        assert_eq!(median_u8(&mut [7, 7, 7, 7]), 7);
    }

    /// Hashed noise moved by `(dx, dy)` and lifted by `brightness`
    fn create_test_texture(seed: u32, dx: i32, dy: i32, brightness: f32) -> Vec<f32> {
        let mut values = Vec::with_capacity(64 * 64);
        for y in 0..64i32 {
            for x in 0..64i32 {
                let (sx, sy) = ((x - dx) as u32, (y - dy) as u32);
                let mut h = sx.wrapping_mul(0x9E37_79B1) ^ sy.wrapping_mul(0x85EB_CA77) ^ seed.wrapping_mul(0xC2B2_AE3D);
                h ^= h >> 15;
                h = h.wrapping_mul(0x2C1B_3C6D);
                h ^= h >> 12;
                values.push((h % 100) as f32 + brightness);
            }
        }
        values
    }

    #[test]
    fn test_shift_estimate_follows_translation() {
        let reference = create_test_texture(0, 0, 0, 0.0);
        let estimator = ShiftEstimator::new(&reference, 64, 64, 4, 8, 32, 0.5);
        assert_eq!(estimator.patch_count(), 32);

        assert_eq!(estimator.estimate(&reference), Some((0, 0)));
        let moved = create_test_texture(0, 2, -3, 40.0);
        assert_eq!(estimator.estimate(&moved), Some((2, -3)));
    }

    #[test]
    fn test_shift_estimate_needs_consensus() {
        let reference = create_test_texture(0, 0, 0, 0.0);
        let estimator = ShiftEstimator::new(&reference, 64, 64, 4, 8, 32, 0.5);
        let unrelated = create_test_texture(1, 0, 0, 0.0);
        assert_eq!(estimator.estimate(&unrelated), None);
    }

    #[test]
    fn test_flat_reference_has_no_patches() {
        let estimator = ShiftEstimator::new(&[50.0; 64 * 64], 64, 64, 4, 8, 32, 0.5);
        assert_eq!(estimator.patch_count(), 0);
        assert_eq!(estimator.estimate(&[50.0; 64 * 64]), None);
    }

    #[test]
    fn test_translate_replicates_borders() {
        let frame = RgbaImage::from_fn(4, 1, |x, _| image::Rgba([x as u8, 0, 0, 255]));
        let moved = translate(&frame, 1, 0);
        let row: Vec<u8> = moved.pixels().map(|p| p[0]).collect();
        assert_eq!(row, vec![1, 2, 3, 3]);
    }
}
