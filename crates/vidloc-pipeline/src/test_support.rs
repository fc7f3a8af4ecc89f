//! In-process collaborators and footage for pipeline tests

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use image::{Rgba, RgbaImage};
use vidloc_core::media::{load_rgba, save_png};
use vidloc_core::{
    Appearance, DetectedPerson, ImageSequenceBackend, MediaBackend, PersonRecord, Persona, Region,
    TransformationTheme, VideoInfo,
};
use vidloc_vision::{CollaboratorError, EditRequest, GenerationProvider, ImageRequest, PerceptionProvider, VideoRequest};

pub const WIDTH: u32 = 200;
pub const HEIGHT: u32 = 160;
pub const FPS: f64 = 4.0;

fn is_caption_box(x: u32, y: u32) -> bool {
    (40..120).contains(&x) && (80..100).contains(&y)
}

fn is_caption_glyph(x: u32, y: u32) -> bool {
    (85..95).contains(&y) && [50, 60, 70].iter().any(|&left| (left..left + 4).contains(&x))
}

fn noise(x: u32, y: u32, seed: u32) -> u8 {
    let mut h = x.wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA77) ^ seed.wrapping_mul(0xC2B2_AE3D);
    h ^= h >> 15;
    h = h.wrapping_mul(0x2C1B_3C6D);
    h ^= h >> 12;
    (h & 0xFF) as u8
}

/// Fresh noise every frame, optionally under a static caption
pub fn create_test_frame(index: u32, caption: bool) -> RgbaImage {
    RgbaImage::from_fn(WIDTH, HEIGHT, |x, y| {
        if caption && is_caption_glyph(x, y) {
            Rgba([255, 255, 255, 255])
        } else if caption && is_caption_box(x, y) {
            Rgba([0, 0, 0, 255])
        } else {
            let v = noise(x, y, index);
            Rgba([v, v.wrapping_add(40), v.wrapping_add(80), 255])
        }
    })
}

pub async fn create_test_video(dir: &Path, frames: u32, caption: bool) -> VideoInfo {
    ImageSequenceBackend
        .write_sequence(dir, FPS, (0..frames).map(|i| create_test_frame(i, caption)))
        .await
        .unwrap();
    ImageSequenceBackend.probe(dir).await.unwrap()
}

pub fn invert(image: &RgbaImage) -> RgbaImage {
    let mut inverted = image.clone();
    for pixel in inverted.pixels_mut() {
        pixel.0 = [255 - pixel.0[0], 255 - pixel.0[1], 255 - pixel.0[2], pixel.0[3]];
    }
    inverted
}

/// Sees the same person on the right of every frame, or nobody
pub struct FakePerception {
    pub people: Vec<DetectedPerson>,
    pub detect_calls: AtomicU32,
}

impl FakePerception {
    pub fn with_person() -> Self {
        Self {
            people: vec![DetectedPerson {
                region: Region::new(130, 20, 50, 120),
                appearance: Appearance {
                    gender: "woman".to_string(),
                    age: "30s".to_string(),
                    skin: "light".to_string(),
                    hair: "long brown hair".to_string(),
                    clothing: "red wool coat".to_string(),
                },
            }],
            detect_calls: AtomicU32::new(0),
        }
    }

    pub fn empty() -> Self {
        Self {
            people: Vec::new(),
            detect_calls: AtomicU32::new(0),
        }
    }
}

impl PerceptionProvider for FakePerception {
    async fn detect_people(&self, _image: &Path) -> Result<Vec<DetectedPerson>, CollaboratorError> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.people.clone())
    }

    async fn design_personas(
        &self,
        originals: &[PersonRecord],
        theme: &TransformationTheme,
    ) -> Result<Vec<Persona>, CollaboratorError> {
        Ok(originals
            .iter()
            .map(|original| Persona {
                appearance: Appearance {
                    clothing: "navy suit".to_string(),
                    ..original.appearance.clone()
                },
                casting_notes: format!("{} lead", theme),
            })
            .collect())
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "fake-perception"
    }

    fn model(&self) -> &str {
        "fake"
    }
}

/// Inverts edited images and builds clips from the two boundary frames
pub struct FakeGeneration {
    /// Edits of images whose path contains this fail with a server error
    pub fail_edits_containing: Option<String>,
    /// Clips come back this many source frames shorter than requested
    pub clip_frames_short: usize,
    pub edit_requests: Mutex<Vec<EditRequest>>,
    pub image_calls: AtomicU32,
    pub video_calls: AtomicU32,
    pub remove_text_calls: AtomicU32,
}

impl FakeGeneration {
    pub fn new() -> Self {
        Self {
            fail_edits_containing: None,
            clip_frames_short: 0,
            edit_requests: Mutex::new(Vec::new()),
            image_calls: AtomicU32::new(0),
            video_calls: AtomicU32::new(0),
            remove_text_calls: AtomicU32::new(0),
        }
    }

    pub fn failing_edits(pattern: &str) -> Self {
        Self {
            fail_edits_containing: Some(pattern.to_string()),
            ..Self::new()
        }
    }

    pub fn short_clips(frames: usize) -> Self {
        Self {
            clip_frames_short: frames,
            ..Self::new()
        }
    }
}

fn collaborator_error(error: impl std::fmt::Display) -> CollaboratorError {
    CollaboratorError::InvalidResponse(error.to_string())
}

impl GenerationProvider for FakeGeneration {
    async fn generate_image(&self, _request: &ImageRequest, output: &Path) -> Result<PathBuf, CollaboratorError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        save_png(RgbaImage::from_pixel(18, 32, Rgba([90, 60, 30, 255])), output)
            .await
            .map_err(collaborator_error)?;
        Ok(output.to_path_buf())
    }

    async fn edit_image(&self, request: &EditRequest, output: &Path) -> Result<PathBuf, CollaboratorError> {
        self.edit_requests.lock().unwrap().push(request.clone());
        if let Some(pattern) = &self.fail_edits_containing {
            if request.image.to_string_lossy().contains(pattern.as_str()) {
                return Err(CollaboratorError::ServerError {
                    status: 503,
                    message: "overloaded".to_string(),
                });
            }
        }
        let image = load_rgba(&request.image).await.map_err(collaborator_error)?;
        save_png(invert(&image), output).await.map_err(collaborator_error)?;
        Ok(output.to_path_buf())
    }

    async fn generate_video(&self, request: &VideoRequest, output: &Path) -> Result<PathBuf, CollaboratorError> {
        self.video_calls.fetch_add(1, Ordering::SeqCst);
        let first = load_rgba(&request.first_frame).await.map_err(collaborator_error)?;
        let last = load_rgba(&request.last_frame).await.map_err(collaborator_error)?;

        // Twice the source frame rate, so every clip has to be conformed
        let count = (request.duration_secs * FPS * 2.0).round() as usize - self.clip_frames_short * 2;
        let frames = (0..count).map(|i| if i < count / 2 { first.clone() } else { last.clone() });
        ImageSequenceBackend
            .write_sequence(output, FPS * 2.0, frames)
            .await
            .map_err(collaborator_error)?;
        Ok(output.to_path_buf())
    }

    async fn remove_text(&self, image: &Path, output: &Path) -> Result<PathBuf, CollaboratorError> {
        self.remove_text_calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::copy(image, output).await?;
        Ok(output.to_path_buf())
    }

    fn name(&self) -> &'static str {
        "fake-generation"
    }
}
