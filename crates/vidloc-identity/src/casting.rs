//! Identity references: persona design and reference portraits
//!
//! Each registered person gets one replacement persona and a set of
//! portraits. The first portrait is rendered from text; every other portrait
//! is an edit of the first, so the whole set shows one face. References are
//! frozen into an [`IdentitySet`] before any frame is edited.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vidloc_artifacts::{Artifact, WorkDir};
use vidloc_core::{
    retry_with_backoff, AspectRatio, IdentityReference, PersonId, PersonRecord, Persona, RetryOutcome, RetryPolicy,
    TransformationTheme,
};
use vidloc_vision::prompts::{self, PORTRAIT_VARIANTS};
use vidloc_vision::{CollaboratorError, EditRequest, GenerationProvider, ImageRequest, PerceptionProvider};

use crate::error::IdentityError;
use crate::registry::PersonRegistry;

/// Identity reference settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CastingConfig {
    /// Portraits per identity, at least 2
    pub portraits_per_identity: usize,
    /// Persona design attempts (a wrong persona count counts as a failure)
    pub persona_attempts: u32,
    /// Portrait aspect ratio
    pub aspect_ratio: AspectRatio,
}

impl Default for CastingConfig {
    fn default() -> Self {
        Self {
            portraits_per_identity: 3,
            persona_attempts: 3,
            aspect_ratio: AspectRatio::Portrait9x16,
        }
    }
}

/// Frozen identity references, shared read-only by every segment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<IdentityReference>", into = "Vec<IdentityReference>")]
pub struct IdentitySet {
    references: BTreeMap<PersonId, Arc<IdentityReference>>,
}

impl IdentitySet {
    pub fn get(&self, person_id: &str) -> Option<Arc<IdentityReference>> {
        self.references.get(person_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// References ordered by `person_id`
    pub fn iter(&self) -> impl Iterator<Item = &Arc<IdentityReference>> {
        self.references.values()
    }
}

impl From<Vec<IdentityReference>> for IdentitySet {
    fn from(references: Vec<IdentityReference>) -> Self {
        Self {
            references: references
                .into_iter()
                .map(|r| (r.person_id.clone(), Arc::new(r)))
                .collect(),
        }
    }
}

impl From<IdentitySet> for Vec<IdentityReference> {
    fn from(set: IdentitySet) -> Self {
        set.references
            .into_values()
            .map(|r| Arc::try_unwrap(r).unwrap_or_else(|shared| (*shared).clone()))
            .collect()
    }
}

impl Artifact for IdentitySet {
    fn referenced_paths(&self) -> Vec<PathBuf> {
        self.iter().flat_map(|r| r.portraits.iter().cloned()).collect()
    }
}

/// Generates one identity reference per registered person
pub struct IdentityGenerator {
    config: CastingConfig,
}

impl IdentityGenerator {
    pub fn new(config: CastingConfig) -> Result<Self, IdentityError> {
        if config.portraits_per_identity < 2 {
            return Err(IdentityError::InvalidPortraitCount(config.portraits_per_identity));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &CastingConfig {
        &self.config
    }

    /// Design personas and render reference portraits for every person
    #[allow(clippy::too_many_arguments)]
    pub async fn generate<P, G>(
        &self,
        perception: &P,
        generation: &G,
        registry: &PersonRegistry,
        theme: &TransformationTheme,
        work_dir: &WorkDir,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<IdentitySet, IdentityError>
    where
        P: PerceptionProvider + Sync,
        G: GenerationProvider + Sync,
    {
        let originals: Vec<PersonRecord> = registry.records().cloned().collect();
        info!(
            "Designing {} replacement identities for '{}'",
            originals.len(),
            theme
        );

        let personas = self.design_personas(perception, &originals, theme, retry, cancel).await?;

        let references = try_join_all(originals.iter().zip(personas).map(|(original, persona)| {
            self.render_identity(generation, original, persona, theme, work_dir, retry, cancel)
        }))
        .await?;

        info!("Identity references frozen for {} people", references.len());
        Ok(IdentitySet::from(references))
    }

    async fn design_personas<P>(
        &self,
        perception: &P,
        originals: &[PersonRecord],
        theme: &TransformationTheme,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Vec<Persona>, IdentityError>
    where
        P: PerceptionProvider + Sync,
    {
        let policy = RetryPolicy {
            max_attempts: self.config.persona_attempts,
            ..*retry
        };
        let expected = originals.len();

        let outcome = retry_with_backoff(
            &policy,
            "Persona design",
            cancel,
            CollaboratorError::is_retryable,
            move |_| async move {
                let personas = perception.design_personas(originals, theme).await?;
                if personas.len() != expected {
                    return Err(CollaboratorError::ParseError(format!(
                        "Expected {} personas, got {}",
                        expected,
                        personas.len()
                    )));
                }
                Ok(personas)
            },
        )
        .await;

        match outcome {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Exhausted { error, attempts } | RetryOutcome::Rejected { error, attempts } => {
                Err(IdentityError::PersonaDesignFailed {
                    attempts,
                    source: error,
                })
            }
            RetryOutcome::Cancelled { .. } => Err(IdentityError::Cancelled),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn render_identity<G>(
        &self,
        generation: &G,
        original: &PersonRecord,
        persona: Persona,
        theme: &TransformationTheme,
        work_dir: &WorkDir,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<IdentityReference, IdentityError>
    where
        G: GenerationProvider + Sync,
    {
        let person_id = original.person_id.as_str();
        let casting = prompts::casting_description(&persona);
        debug!("Casting {} as {}", person_id, casting);

        let target = work_dir.portrait(person_id, 0);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let request = ImageRequest {
            prompt: prompts::build_portrait_prompt(&casting, &original.appearance.clothing),
            aspect_ratio: self.config.aspect_ratio,
        };
        let target_ref = &target;
        let request_ref = &request;
        let outcome = retry_with_backoff(
            retry,
            &format!("Portrait 0 for {}", person_id),
            cancel,
            CollaboratorError::is_retryable,
            move |_| generation.generate_image(request_ref, target_ref),
        )
        .await;
        // Providers may save somewhere other than the requested path
        let frontal = settle(outcome, person_id, 0)?;

        let variants = (1..self.config.portraits_per_identity).map(|number| {
            let frontal = frontal.clone();
            async move {
                let output = work_dir.portrait(person_id, number);
                let variant = PORTRAIT_VARIANTS[(number - 1) % PORTRAIT_VARIANTS.len()];
                let request = EditRequest {
                    image: frontal,
                    references: Vec::new(),
                    instruction: prompts::build_portrait_variant_prompt(variant),
                    aspect_ratio: self.config.aspect_ratio,
                };
                let output_ref = &output;
                let request_ref = &request;
                let outcome = retry_with_backoff(
                    retry,
                    &format!("Portrait {} for {}", number, person_id),
                    cancel,
                    CollaboratorError::is_retryable,
                    move |_| generation.edit_image(request_ref, output_ref),
                )
                .await;
                settle(outcome, person_id, number)
            }
        });
        let variants = try_join_all(variants).await?;
        let mut portraits = Vec::with_capacity(variants.len() + 1);
        portraits.push(frontal);
        portraits.extend(variants);

        info!("{} portraits ready for {}", portraits.len(), person_id);

        Ok(IdentityReference {
            person_id: original.person_id.clone(),
            theme: theme.clone(),
            persona,
            casting_description: casting,
            portraits,
        })
    }
}

/// Turn a portrait retry outcome into its path or an identity error
fn settle(
    outcome: RetryOutcome<PathBuf, CollaboratorError>,
    person_id: &str,
    number: usize,
) -> Result<PathBuf, IdentityError> {
    match outcome {
        RetryOutcome::Success { value, .. } => Ok(value),
        RetryOutcome::Exhausted { error, attempts } | RetryOutcome::Rejected { error, attempts } => {
            Err(IdentityError::PortraitFailed {
                person_id: person_id.to_string(),
                number,
                attempts,
                source: error,
            })
        }
        RetryOutcome::Cancelled { .. } => Err(IdentityError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use vidloc_core::{Appearance, Boundary, DetectedPerson, Region};
    use vidloc_vision::VideoRequest;

    use crate::registry::{FrameObservation, RegistryBuilder, RegistryConfig};

    struct FakePerception {
        calls: AtomicU32,
        /// Persona count returned on the first call
        first_count: usize,
    }

    impl PerceptionProvider for FakePerception {
        async fn detect_people(&self, _image: &Path) -> Result<Vec<DetectedPerson>, CollaboratorError> {
            Ok(Vec::new())
        }

        async fn design_personas(
            &self,
            originals: &[PersonRecord],
            _theme: &TransformationTheme,
        ) -> Result<Vec<Persona>, CollaboratorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let count = if call == 0 { self.first_count } else { originals.len() };
            Ok((0..count)
                .map(|i| Persona {
                    appearance: Appearance {
                        gender: "woman".to_string(),
                        age: format!("{}0s", i + 2),
                        ..Default::default()
                    },
                    casting_notes: String::new(),
                })
                .collect())
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

    #[derive(Default)]
    struct FakeGeneration {
        edits: Mutex<Vec<EditRequest>>,
        /// Saves portraits with this extension instead of the requested one
        portrait_extension: Option<&'static str>,
    }

    impl GenerationProvider for FakeGeneration {
        async fn generate_image(&self, _request: &ImageRequest, output: &Path) -> Result<PathBuf, CollaboratorError> {
            let saved = match self.portrait_extension {
                Some(extension) => output.with_extension(extension),
                None => output.to_path_buf(),
            };
            tokio::fs::write(&saved, b"portrait").await?;
            Ok(saved)
        }

        async fn edit_image(&self, request: &EditRequest, output: &Path) -> Result<PathBuf, CollaboratorError> {
            self.edits.lock().unwrap().push(request.clone());
            tokio::fs::write(output, b"variant").await?;
            Ok(output.to_path_buf())
        }

        async fn generate_video(&self, _request: &VideoRequest, _output: &Path) -> Result<PathBuf, CollaboratorError> {
            Err(CollaboratorError::ConfigError("not used".to_string()))
        }

        async fn remove_text(&self, _image: &Path, _output: &Path) -> Result<PathBuf, CollaboratorError> {
            Err(CollaboratorError::ConfigError("not used".to_string()))
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn create_test_registry() -> PersonRegistry {
        let observation = FrameObservation {
            segment_index: 0,
            boundary: Boundary::Start,
            frame_index: 0,
            width: 300,
            height: 200,
            people: vec![
                DetectedPerson {
                    region: Region::new(10, 10, 60, 150),
                    appearance: Appearance {
                        gender: "man".to_string(),
                        clothing: "grey suit".to_string(),
                        ..Default::default()
                    },
                },
                DetectedPerson {
                    region: Region::new(200, 10, 60, 150),
                    appearance: Appearance {
                        gender: "woman".to_string(),
                        clothing: "yellow dress".to_string(),
                        ..Default::default()
                    },
                },
            ],
        };
        RegistryBuilder::new(RegistryConfig::default())
            .correlate(&[observation])
            .unwrap()
    }

    #[test]
    fn test_rejects_single_portrait() {
        let config = CastingConfig {
            portraits_per_identity: 1,
            ..Default::default()
        };
        assert!(matches!(
            IdentityGenerator::new(config),
            Err(IdentityError::InvalidPortraitCount(1))
        ));
    }

    #[tokio::test]
    async fn test_generate_identity_set() {
        let temp = TempDir::new().unwrap();
        let work_dir = WorkDir::create(temp.path().join("run")).await.unwrap();
        let perception = FakePerception {
            calls: AtomicU32::new(0),
            first_count: 2,
        };
        let generation = FakeGeneration::default();
        let generator = IdentityGenerator::new(CastingConfig::default()).unwrap();

        let set = generator
            .generate(
                &perception,
                &generation,
                &create_test_registry(),
                &TransformationTheme::new("Brazilian family"),
                &work_dir,
                &RetryPolicy::new(2).with_delays(1, 1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(set.len(), 2);
        let reference = set.get("person_001").unwrap();
        assert_eq!(reference.portraits.len(), 3);
        assert_eq!(reference.portraits[0], work_dir.portrait("person_001", 0));
        assert!(reference.portraits.iter().all(|p| p.exists()));

        // Variants are edits of the frontal portrait of the same person
        let edits = generation.edits.lock().unwrap();
        assert_eq!(edits.len(), 4);
        for edit in edits.iter() {
            assert!(edit.image.ends_with("portrait_0.png"));
        }
    }

    #[tokio::test]
    async fn test_variants_follow_saved_frontal_portrait() {
        let temp = TempDir::new().unwrap();
        let work_dir = WorkDir::create(temp.path().join("run")).await.unwrap();
        let perception = FakePerception {
            calls: AtomicU32::new(0),
            first_count: 2,
        };
        let generation = FakeGeneration {
            portrait_extension: Some("jpg"),
            ..Default::default()
        };
        let generator = IdentityGenerator::new(CastingConfig::default()).unwrap();

        let set = generator
            .generate(
                &perception,
                &generation,
                &create_test_registry(),
                &TransformationTheme::new("Brazilian family"),
                &work_dir,
                &RetryPolicy::new(2).with_delays(1, 1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let reference = set.get("person_001").unwrap();
        let frontal = work_dir.portrait("person_001", 0).with_extension("jpg");
        assert_eq!(reference.portraits[0], frontal);
        assert!(reference.portraits.iter().all(|p| p.exists()));

        let edits = generation.edits.lock().unwrap();
        assert!(edits.iter().any(|edit| edit.image == frontal));
        assert!(edits.iter().all(|edit| edit.image.extension().unwrap() == "jpg"));
    }

    #[tokio::test]
    async fn test_persona_count_mismatch_is_retried() {
        let temp = TempDir::new().unwrap();
        let work_dir = WorkDir::create(temp.path().join("run")).await.unwrap();
        let perception = FakePerception {
            calls: AtomicU32::new(0),
            first_count: 1,
        };
        let generator = IdentityGenerator::new(CastingConfig::default()).unwrap();

        let set = generator
            .generate(
                &perception,
                &FakeGeneration::default(),
                &create_test_registry(),
                &TransformationTheme::new("Nigerian office workers"),
                &work_dir,
                &RetryPolicy::new(2).with_delays(1, 1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(perception.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_identity_set_shares_instances() {
        let reference = IdentityReference {
            person_id: "person_001".to_string(),
            theme: TransformationTheme::new("theme"),
            persona: Persona {
                appearance: Appearance::default(),
                casting_notes: String::new(),
            },
            casting_description: "person".to_string(),
            portraits: vec![PathBuf::from("a.png"), PathBuf::from("b.png")],
        };
        let set = IdentitySet::from(vec![reference]);

        let first = set.get("person_001").unwrap();
        let second = set.get("person_001").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(set.get("person_002").is_none());

        let json = serde_json::to_string(&set).unwrap();
        let restored: IdentitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(set.referenced_paths().len(), 2);
    }
}
