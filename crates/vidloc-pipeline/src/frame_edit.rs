//! Boundary frame editing
//!
//! Replaces every registered person visible in a text-removed boundary frame
//! with their frozen identity. The edit request carries all reference
//! portraits of every visible person, so the same person gets the same
//! references in every segment.

use std::path::Path;
use std::sync::Arc;

use image::imageops::FilterType;
use image::RgbaImage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vidloc_core::media::{load_rgba, save_png};
use vidloc_core::{
    retry_with_backoff, AspectRatio, Boundary, EditedFrame, IdentityReference, MediaError, Region, RetryOutcome,
    Segment,
};
use vidloc_identity::{describe_position, IdentitySet, PersonRegistry};
use vidloc_vision::prompts::{build_frame_edit_prompt, EditSubject};
use vidloc_vision::{EditRequest, GenerationProvider, PerceptionProvider};

use crate::config::FrameEditConfig;
use crate::error::{EditAttemptError, FrameEditError};

/// Largest relative aspect difference accepted (and corrected by resizing) in an edit result
const ASPECT_TOLERANCE: f64 = 0.02;

/// Edits segment boundary frames against the frozen identities
pub struct FrameEditor<'a, P, G> {
    perception: &'a P,
    generation: &'a G,
    registry: &'a PersonRegistry,
    identities: &'a IdentitySet,
    config: &'a FrameEditConfig,
}

/// Both edited boundary frames of a segment
#[derive(Debug, Clone)]
pub struct EditedBoundaries {
    pub start: EditedFrame,
    pub end: EditedFrame,
}

impl EditedBoundaries {
    pub fn attempts(&self) -> u32 {
        self.start.attempts + self.end.attempts
    }
}

impl<'a, P, G> FrameEditor<'a, P, G>
where
    P: PerceptionProvider + Sync,
    G: GenerationProvider + Sync,
{
    pub fn new(
        perception: &'a P,
        generation: &'a G,
        registry: &'a PersonRegistry,
        identities: &'a IdentitySet,
        config: &'a FrameEditConfig,
    ) -> Self {
        Self {
            perception,
            generation,
            registry,
            identities,
            config,
        }
    }

    /// Edit the start and end frames of a segment concurrently
    ///
    /// `cleaned` and `edited` map a boundary to the input and output frame paths.
    pub async fn edit_segment(
        &self,
        segment: &Segment,
        cleaned: impl Fn(Boundary) -> std::path::PathBuf,
        edited: impl Fn(Boundary) -> std::path::PathBuf,
        cancel: &CancellationToken,
    ) -> Result<EditedBoundaries, FrameEditError> {
        let start_input = cleaned(Boundary::Start);
        let start_output = edited(Boundary::Start);
        let end_input = cleaned(Boundary::End);
        let end_output = edited(Boundary::End);

        let (start, end) = tokio::try_join!(
            self.edit_frame(segment, Boundary::Start, &start_input, &start_output, cancel),
            self.edit_frame(segment, Boundary::End, &end_input, &end_output, cancel),
        )?;

        Ok(EditedBoundaries { start, end })
    }

    /// Edit one boundary frame
    pub async fn edit_frame(
        &self,
        segment: &Segment,
        boundary: Boundary,
        cleaned: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<EditedFrame, FrameEditError> {
        if cancel.is_cancelled() {
            return Err(FrameEditError::Cancelled);
        }

        let source_frame_index = segment.boundary(boundary).frame_index;
        let visible = self.registry.people_at(segment.index, boundary);

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if visible.is_empty() {
            debug!(
                "No registered person in segment {} {} frame, passing it through",
                segment.index, boundary
            );
            tokio::fs::copy(cleaned, output).await?;
            return Ok(EditedFrame {
                segment_index: segment.index,
                boundary,
                source_frame_index,
                path: output.to_path_buf(),
                identities: Vec::new(),
                attempts: 0,
            });
        }

        let identities = visible
            .iter()
            .map(|(record, _)| {
                self.identities
                    .get(&record.person_id)
                    .ok_or_else(|| FrameEditError::MissingIdentity(record.person_id.clone()))
            })
            .collect::<Result<Vec<Arc<IdentityReference>>, _>>()?;

        let (width, height) = image::image_dimensions(cleaned).map_err(MediaError::from)?;
        let positions: Vec<String> = visible
            .iter()
            .map(|(_, sighting)| describe_position(&sighting.region, width))
            .collect();
        let originals: Vec<String> = visible.iter().map(|(record, _)| record.appearance.description()).collect();

        // Image 1 is the frame; each person's portraits follow in person_id order
        let mut references = Vec::new();
        let mut subjects = Vec::with_capacity(identities.len());
        for (index, identity) in identities.iter().enumerate() {
            subjects.push(EditSubject {
                position: &positions[index],
                original: &originals[index],
                replacement: &identity.casting_description,
                first_reference: references.len() + 2,
                reference_count: identity.portraits.len(),
            });
            references.extend(identity.portraits.iter().cloned());
        }

        let request = EditRequest {
            image: cleaned.to_path_buf(),
            references,
            instruction: build_frame_edit_prompt(&subjects),
            aspect_ratio: AspectRatio::from_dimensions(width, height),
        };
        let regions: Vec<Region> = visible.iter().map(|(_, sighting)| sighting.region).collect();

        let operation = format!("Edit of segment {} {} frame", segment.index, boundary);
        let request = &request;
        let regions = &regions;
        let expected_people = visible.len();
        let outcome = retry_with_backoff(
            &self.config.retry,
            &operation,
            cancel,
            EditAttemptError::is_retryable,
            move |_| async move {
                self.generation.edit_image(request, output).await?;
                self.finish_edit(cleaned, output, regions, expected_people).await
            },
        )
        .await;

        match outcome {
            RetryOutcome::Success { attempts, .. } => {
                info!(
                    "Edited segment {} {} frame ({} person(s), {} attempt(s))",
                    segment.index, boundary, expected_people, attempts
                );
                Ok(EditedFrame {
                    segment_index: segment.index,
                    boundary,
                    source_frame_index,
                    path: output.to_path_buf(),
                    identities,
                    attempts,
                })
            }
            RetryOutcome::Exhausted { error, attempts } | RetryOutcome::Rejected { error, attempts } => {
                Err(FrameEditError::Failed {
                    segment: segment.index,
                    boundary,
                    attempts,
                    source: error,
                })
            }
            RetryOutcome::Cancelled { .. } => Err(FrameEditError::Cancelled),
        }
    }

    /// Bring the edit result in line with its source frame, rejecting results that cannot be
    async fn finish_edit(
        &self,
        source: &Path,
        edited: &Path,
        regions: &[Region],
        expected_people: usize,
    ) -> Result<(), EditAttemptError> {
        let source_image = load_rgba(source).await?;
        let edited_image = load_rgba(edited).await?;

        let confine = self.config.confine_to_person_regions;
        let padding = self.config.region_padding;
        let regions = regions.to_vec();
        let adjusted = tokio::task::spawn_blocking(move || {
            conform_edit(&source_image, edited_image, &regions, confine, padding)
        })
        .await
        .map_err(|e| MediaError::TaskFailed(e.to_string()))??;

        if let Some(image) = adjusted {
            save_png(image, edited).await?;
        }

        if self.config.verify_person_count {
            let found = self.perception.detect_people(edited).await?.len();
            if found != expected_people {
                return Err(EditAttemptError::Inconsistent(format!(
                    "expected {} person(s), found {}",
                    expected_people, found
                )));
            }
        }
        Ok(())
    }
}

/// Resize to the source size and optionally restore pixels outside the person regions
///
/// Returns `None` when the edit is already usable as written.
fn conform_edit(
    source: &RgbaImage,
    edited: RgbaImage,
    regions: &[Region],
    confine: bool,
    padding: u32,
) -> Result<Option<RgbaImage>, EditAttemptError> {
    let (width, height) = source.dimensions();
    let (edited_width, edited_height) = edited.dimensions();
    if edited_width == 0 || edited_height == 0 {
        return Err(EditAttemptError::Inconsistent("edited frame is empty".to_string()));
    }

    let mut changed = false;
    let mut edited = edited;
    if (edited_width, edited_height) != (width, height) {
        let source_aspect = width as f64 / height as f64;
        let edited_aspect = edited_width as f64 / edited_height as f64;
        if (source_aspect - edited_aspect).abs() / source_aspect > ASPECT_TOLERANCE {
            return Err(EditAttemptError::Inconsistent(format!(
                "edited frame is {}x{}, source is {}x{}",
                edited_width, edited_height, width, height
            )));
        }
        edited = image::imageops::resize(&edited, width, height, FilterType::Lanczos3);
        changed = true;
    }

    if confine {
        let padded: Vec<Region> = regions.iter().map(|r| r.padded(padding, width, height)).collect();
        for (x, y, pixel) in edited.enumerate_pixels_mut() {
            if !padded.iter().any(|r| r.contains(x, y)) {
                *pixel = *source.get_pixel(x, y);
            }
        }
        changed = true;
    }

    Ok(changed.then_some(edited))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use image::Rgba;
    use tempfile::TempDir;
    use vidloc_core::{
        Appearance, DetectedPerson, FrameImage, FrameSpan, PersonRecord, Persona, RetryPolicy, TransformationTheme,
    };
    use vidloc_identity::{FrameObservation, RegistryBuilder, RegistryConfig};
    use vidloc_vision::{CollaboratorError, ImageRequest, VideoRequest};

    const WIDTH: u32 = 90;
    const HEIGHT: u32 = 60;

    struct FakePerception {
        people: usize,
    }

    impl PerceptionProvider for FakePerception {
        async fn detect_people(&self, _image: &Path) -> Result<Vec<DetectedPerson>, CollaboratorError> {
            Ok((0..self.people)
                .map(|_| DetectedPerson {
                    region: Region::new(0, 0, 10, 10),
                    appearance: Appearance::default(),
                })
                .collect())
        }

        async fn design_personas(
            &self,
            _originals: &[PersonRecord],
            _theme: &TransformationTheme,
        ) -> Result<Vec<Persona>, CollaboratorError> {
            Ok(Vec::new())
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "fake"
        }

        fn model(&self) -> &str {
            "fake"
        }
    }

    /// Paints the whole frame one color; optionally fails first or returns a wrong size
    struct FakeEditor {
        requests: Mutex<Vec<EditRequest>>,
        failures_left: AtomicU32,
        size: (u32, u32),
    }

    impl FakeEditor {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(0),
                size: (WIDTH, HEIGHT),
            }
        }
    }

    impl GenerationProvider for FakeEditor {
        async fn generate_image(&self, _request: &ImageRequest, output: &Path) -> Result<PathBuf, CollaboratorError> {
            Ok(output.to_path_buf())
        }

        async fn edit_image(&self, request: &EditRequest, output: &Path) -> Result<PathBuf, CollaboratorError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(CollaboratorError::ServerError {
                    status: 503,
                    message: "busy".to_string(),
                });
            }
            let image = RgbaImage::from_pixel(self.size.0, self.size.1, Rgba([200, 10, 10, 255]));
            image.save(output)?;
            Ok(output.to_path_buf())
        }

        async fn generate_video(&self, _request: &VideoRequest, output: &Path) -> Result<PathBuf, CollaboratorError> {
            Ok(output.to_path_buf())
        }

        async fn remove_text(&self, _image: &Path, output: &Path) -> Result<PathBuf, CollaboratorError> {
            Ok(output.to_path_buf())
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn create_test_appearance(clothing: &str) -> Appearance {
        Appearance {
            gender: "woman".to_string(),
            age: "30s".to_string(),
            skin: "light".to_string(),
            hair: "long brown hair".to_string(),
            clothing: clothing.to_string(),
        }
    }

    fn create_test_segment(index: usize, dir: &Path) -> Segment {
        let span = FrameSpan::new(index as u64 * 10, index as u64 * 10 + 10);
        Segment {
            index,
            span,
            fps: 10.0,
            start_frame: FrameImage {
                frame_index: span.start,
                path: dir.join("start.png"),
            },
            end_frame: FrameImage {
                frame_index: span.last(),
                path: dir.join("end.png"),
            },
        }
    }

    /// One person in both frames of segment 0, nobody in segment 1
    fn create_test_registry() -> PersonRegistry {
        let person = DetectedPerson {
            region: Region::new(60, 10, 20, 40),
            appearance: create_test_appearance("green raincoat"),
        };
        let observations = vec![
            FrameObservation {
                segment_index: 0,
                boundary: Boundary::Start,
                frame_index: 0,
                width: WIDTH,
                height: HEIGHT,
                people: vec![person.clone()],
            },
            FrameObservation {
                segment_index: 0,
                boundary: Boundary::End,
                frame_index: 9,
                width: WIDTH,
                height: HEIGHT,
                people: vec![person],
            },
            FrameObservation {
                segment_index: 1,
                boundary: Boundary::Start,
                frame_index: 10,
                width: WIDTH,
                height: HEIGHT,
                people: vec![],
            },
        ];
        RegistryBuilder::new(RegistryConfig::default())
            .correlate(&observations)
            .unwrap()
    }

    fn create_test_identities(dir: &Path) -> IdentitySet {
        IdentitySet::from(vec![IdentityReference {
            person_id: "person_001".to_string(),
            theme: TransformationTheme::new("Japanese"),
            persona: Persona {
                appearance: create_test_appearance("navy blazer"),
                casting_notes: String::new(),
            },
            casting_description: "Japanese woman in her 30s".to_string(),
            portraits: (0..3).map(|n| dir.join(format!("portrait_{}.png", n))).collect(),
        }])
    }

    fn create_test_frame(dir: &Path) -> PathBuf {
        let path = dir.join("cleaned.png");
        RgbaImage::from_pixel(WIDTH, HEIGHT, Rgba([0, 0, 255, 255]))
            .save(&path)
            .unwrap();
        path
    }

    fn create_test_config() -> FrameEditConfig {
        FrameEditConfig {
            retry: RetryPolicy::new(3).with_delays(1, 1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_edit_sends_every_portrait_and_shares_identity() {
        let temp = TempDir::new().unwrap();
        let registry = create_test_registry();
        let identities = create_test_identities(temp.path());
        let config = create_test_config();
        let perception = FakePerception { people: 1 };
        let generation = FakeEditor::new();
        let editor = FrameEditor::new(&perception, &generation, &registry, &identities, &config);
        let segment = create_test_segment(0, temp.path());
        let cleaned = create_test_frame(temp.path());

        let edited = editor
            .edit_segment(
                &segment,
                |_| cleaned.clone(),
                |b| temp.path().join(format!("edited_{}.png", b)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(edited.start.person_ids(), vec!["person_001"]);
        assert_eq!(edited.attempts(), 2);
        assert!(Arc::ptr_eq(&edited.start.identities[0], &edited.end.identities[0]));

        let requests = generation.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        for request in requests.iter() {
            assert_eq!(request.references, identities.get("person_001").unwrap().portraits);
            assert!(request.instruction.contains("images 2-4"));
            assert!(request.instruction.contains("right third of the frame"));
        }
    }

    #[tokio::test]
    async fn test_frame_without_people_passes_through() {
        let temp = TempDir::new().unwrap();
        let registry = create_test_registry();
        let identities = create_test_identities(temp.path());
        let config = create_test_config();
        let perception = FakePerception { people: 0 };
        let generation = FakeEditor::new();
        let editor = FrameEditor::new(&perception, &generation, &registry, &identities, &config);
        let segment = create_test_segment(1, temp.path());
        let cleaned = create_test_frame(temp.path());
        let output = temp.path().join("edited.png");

        let edited = editor
            .edit_frame(&segment, Boundary::Start, &cleaned, &output, &CancellationToken::new())
            .await
            .unwrap();

        assert!(edited.is_passthrough());
        assert_eq!(edited.attempts, 0);
        assert_eq!(std::fs::read(&output).unwrap(), std::fs::read(&cleaned).unwrap());
        assert!(generation.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let temp = TempDir::new().unwrap();
        let registry = create_test_registry();
        let identities = create_test_identities(temp.path());
        let config = create_test_config();
        let perception = FakePerception { people: 1 };
        let generation = FakeEditor::new();
        generation.failures_left.store(2, Ordering::SeqCst);
        let editor = FrameEditor::new(&perception, &generation, &registry, &identities, &config);
        let segment = create_test_segment(0, temp.path());
        let cleaned = create_test_frame(temp.path());

        let edited = editor
            .edit_frame(
                &segment,
                Boundary::Start,
                &cleaned,
                &temp.path().join("edited.png"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(edited.attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_frame() {
        let temp = TempDir::new().unwrap();
        let registry = create_test_registry();
        let identities = create_test_identities(temp.path());
        let config = create_test_config();
        let perception = FakePerception { people: 1 };
        let generation = FakeEditor::new();
        generation.failures_left.store(10, Ordering::SeqCst);
        let editor = FrameEditor::new(&perception, &generation, &registry, &identities, &config);
        let segment = create_test_segment(0, temp.path());
        let cleaned = create_test_frame(temp.path());

        let result = editor
            .edit_frame(
                &segment,
                Boundary::End,
                &cleaned,
                &temp.path().join("edited.png"),
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(FrameEditError::Failed {
                segment, attempts, ..
            }) => {
                assert_eq!(segment, 0);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_result_resized_to_source() {
        let temp = TempDir::new().unwrap();
        let registry = create_test_registry();
        let identities = create_test_identities(temp.path());
        let config = create_test_config();
        let perception = FakePerception { people: 1 };
        let mut generation = FakeEditor::new();
        generation.size = (WIDTH * 2, HEIGHT * 2);
        let editor = FrameEditor::new(&perception, &generation, &registry, &identities, &config);
        let segment = create_test_segment(0, temp.path());
        let cleaned = create_test_frame(temp.path());
        let output = temp.path().join("edited.png");

        editor
            .edit_frame(&segment, Boundary::Start, &cleaned, &output, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(image::image_dimensions(&output).unwrap(), (WIDTH, HEIGHT));
    }

    #[tokio::test]
    async fn test_wrong_aspect_is_rejected() {
        let temp = TempDir::new().unwrap();
        let registry = create_test_registry();
        let identities = create_test_identities(temp.path());
        let config = create_test_config();
        let perception = FakePerception { people: 1 };
        let mut generation = FakeEditor::new();
        generation.size = (HEIGHT, WIDTH);
        let editor = FrameEditor::new(&perception, &generation, &registry, &identities, &config);
        let segment = create_test_segment(0, temp.path());
        let cleaned = create_test_frame(temp.path());

        let result = editor
            .edit_frame(
                &segment,
                Boundary::Start,
                &cleaned,
                &temp.path().join("edited.png"),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(FrameEditError::Failed {
                source: EditAttemptError::Inconsistent(_),
                attempts: 3,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_person_count_verification() {
        let temp = TempDir::new().unwrap();
        let registry = create_test_registry();
        let identities = create_test_identities(temp.path());
        let config = FrameEditConfig {
            verify_person_count: true,
            ..create_test_config()
        };
        let perception = FakePerception { people: 2 };
        let generation = FakeEditor::new();
        let editor = FrameEditor::new(&perception, &generation, &registry, &identities, &config);
        let segment = create_test_segment(0, temp.path());
        let cleaned = create_test_frame(temp.path());

        let result = editor
            .edit_frame(
                &segment,
                Boundary::Start,
                &cleaned,
                &temp.path().join("edited.png"),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(FrameEditError::Failed { .. })));
    }

    #[test]
    fn test_confine_restores_background() {
        let source = RgbaImage::from_pixel(20, 20, Rgba([0, 0, 255, 255]));
        let edited = RgbaImage::from_pixel(20, 20, Rgba([255, 0, 0, 255]));

        let confined = conform_edit(&source, edited, &[Region::new(5, 5, 4, 4)], true, 1)
            .unwrap()
            .unwrap();

        assert_eq!(confined.get_pixel(6, 6), &Rgba([255, 0, 0, 255]));
        assert_eq!(confined.get_pixel(4, 4), &Rgba([255, 0, 0, 255]));
        assert_eq!(confined.get_pixel(15, 15), &Rgba([0, 0, 255, 255]));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let temp = TempDir::new().unwrap();
        let registry = create_test_registry();
        let identities = create_test_identities(temp.path());
        let config = create_test_config();
        let perception = FakePerception { people: 1 };
        let generation = FakeEditor::new();
        let editor = FrameEditor::new(&perception, &generation, &registry, &identities, &config);
        let segment = create_test_segment(0, temp.path());
        let cleaned = create_test_frame(temp.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = editor
            .edit_frame(&segment, Boundary::Start, &cleaned, &temp.path().join("e.png"), &cancel)
            .await;

        assert!(matches!(result, Err(FrameEditError::Cancelled)));
        assert!(generation.requests.lock().unwrap().is_empty());
    }
}
