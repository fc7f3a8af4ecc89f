//! Person registry: detection on boundary frames and cross-frame correlation
//!
//! Detections are correlated in time order. A detection in the sampled frame
//! right after a person's last sighting is scored on appearance and spatial
//! continuity; a detection after a gap (re-entry) is scored on appearance
//! alone against a stricter threshold. Scores that fall just short of a
//! threshold are still merged, since two references for one person is the
//! worse failure.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vidloc_artifacts::Artifact;
use vidloc_core::{
    retry_with_backoff, Appearance, Boundary, DetectedPerson, PersonId, PersonRecord, Region, RetryOutcome,
    RetryPolicy, Sighting,
};
use vidloc_vision::{CollaboratorError, PerceptionProvider};

use crate::error::RegistryError;

const STOP_WORDS: [&str; 6] = ["a", "an", "and", "the", "with", "of"];

/// Correlation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Minimum score for a match in the next sampled frame
    pub match_threshold: f64,
    /// Minimum appearance score for a match after a gap
    pub reentry_threshold: f64,
    /// Scores this far below a threshold still merge
    pub ambiguity_margin: f64,
    /// Share of appearance in the adjacent-frame score; the rest is spatial
    pub appearance_weight: f64,
    /// Detection calls in flight at once
    pub detection_concurrency: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.5,
            reentry_threshold: 0.65,
            ambiguity_margin: 0.05,
            appearance_weight: 0.6,
            detection_concurrency: 4,
        }
    }
}

/// A text-removed boundary frame to run detection on
#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub segment_index: usize,
    pub boundary: Boundary,
    pub frame_index: u64,
    pub path: PathBuf,
}

/// Detections for one sampled frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameObservation {
    pub segment_index: usize,
    pub boundary: Boundary,
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    pub people: Vec<DetectedPerson>,
}

/// Every person found in the source, keyed by `person_id`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonRegistry {
    records: BTreeMap<PersonId, PersonRecord>,
}

impl PersonRegistry {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, person_id: &str) -> Option<&PersonRecord> {
        self.records.get(person_id)
    }

    /// Records ordered by `person_id`
    pub fn records(&self) -> impl Iterator<Item = &PersonRecord> {
        self.records.values()
    }

    /// People visible at a segment boundary, ordered by `person_id`
    pub fn people_at(&self, segment_index: usize, boundary: Boundary) -> Vec<(&PersonRecord, &Sighting)> {
        self.records
            .values()
            .filter_map(|record| {
                record
                    .sighting_at(segment_index, boundary)
                    .map(|sighting| (record, sighting))
            })
            .collect()
    }
}

impl Artifact for PersonRegistry {}

/// Builds the person registry from boundary frames
pub struct RegistryBuilder {
    config: RegistryConfig,
}

impl RegistryBuilder {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }

    /// Detect people on every frame, then correlate them into a registry
    pub async fn build<P>(
        &self,
        provider: &P,
        frames: &[SampledFrame],
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<PersonRegistry, RegistryError>
    where
        P: PerceptionProvider + Sync,
    {
        info!(
            "Detecting people on {} boundary frames with {}",
            frames.len(),
            provider.name()
        );
        let observations = self.detect(provider, frames, retry, cancel).await?;
        self.correlate(&observations)
    }

    /// Run detection on every frame, in frame order
    pub async fn detect<P>(
        &self,
        provider: &P,
        frames: &[SampledFrame],
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Vec<FrameObservation>, RegistryError>
    where
        P: PerceptionProvider + Sync,
    {
        let results: Vec<Result<FrameObservation, RegistryError>> = stream::iter(frames)
            .map(|frame| detect_frame(provider, frame, retry, cancel))
            .buffered(self.config.detection_concurrency.max(1))
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Correlate detections across frames into person records
    pub fn correlate(&self, observations: &[FrameObservation]) -> Result<PersonRegistry, RegistryError> {
        let mut ordered: Vec<&FrameObservation> = observations.iter().collect();
        ordered.sort_by_key(|o| (o.frame_index, o.boundary, o.segment_index));

        let mut tracks: Vec<Track> = Vec::new();

        for (order, observation) in ordered.iter().enumerate() {
            let diagonal = ((observation.width as f64).powi(2) + (observation.height as f64).powi(2)).sqrt();

            let mut candidates = Vec::new();
            for (t, track) in tracks.iter().enumerate() {
                for (d, person) in observation.people.iter().enumerate() {
                    let (score, threshold) = self.score(track, person, order, diagonal);
                    if score >= threshold - self.config.ambiguity_margin {
                        candidates.push((score, threshold, t, d));
                    }
                }
            }
            candidates.sort_by(|a, b| {
                b.0.total_cmp(&a.0)
                    .then(a.2.cmp(&b.2))
                    .then(a.3.cmp(&b.3))
            });

            let mut track_taken = vec![false; tracks.len()];
            let mut detection_taken = vec![false; observation.people.len()];

            for (score, threshold, t, d) in candidates {
                if track_taken[t] || detection_taken[d] {
                    continue;
                }
                if score < threshold {
                    debug!(
                        "Ambiguous match merged into {} (score {:.2}, threshold {:.2})",
                        tracks[t].person_id, score, threshold
                    );
                }
                track_taken[t] = true;
                detection_taken[d] = true;
                tracks[t].observe(observation, &observation.people[d], order);
            }

            for (d, person) in observation.people.iter().enumerate() {
                if detection_taken[d] {
                    continue;
                }
                let person_id = format!("person_{:03}", tracks.len() + 1);
                debug!(
                    "New person {} in segment {} {} frame",
                    person_id, observation.segment_index, observation.boundary
                );
                tracks.push(Track::open(person_id, observation, person, order));
            }
        }

        if tracks.is_empty() {
            return Err(RegistryError::NoPersonDetected {
                frames: observations.len(),
            });
        }

        let records: BTreeMap<PersonId, PersonRecord> = tracks
            .into_iter()
            .map(|track| {
                let record = track.into_record();
                (record.person_id.clone(), record)
            })
            .collect();

        info!(
            "Registered {} people from {} frames",
            records.len(),
            observations.len()
        );
        Ok(PersonRegistry { records })
    }

    /// Match score and the threshold it must reach
    fn score(&self, track: &Track, person: &DetectedPerson, order: usize, diagonal: f64) -> (f64, f64) {
        let appearance = track
            .appearances
            .iter()
            .map(|a| appearance_similarity(a, &person.appearance))
            .fold(0.0, f64::max);

        if track.last_seen + 1 == order {
            let spatial = spatial_continuity(&track.last_region, &person.region, diagonal);
            let weight = self.config.appearance_weight.clamp(0.0, 1.0);
            (
                weight * appearance + (1.0 - weight) * spatial,
                self.config.match_threshold,
            )
        } else {
            (appearance, self.config.reentry_threshold)
        }
    }
}

async fn detect_frame<P>(
    provider: &P,
    frame: &SampledFrame,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<FrameObservation, RegistryError>
where
    P: PerceptionProvider + Sync,
{
    let (width, height) = image::image_dimensions(&frame.path)?;
    let operation = format!(
        "Person detection (segment {} {})",
        frame.segment_index, frame.boundary
    );

    let outcome = retry_with_backoff(retry, &operation, cancel, CollaboratorError::is_retryable, move |_| {
        provider.detect_people(&frame.path)
    })
    .await;

    match outcome {
        RetryOutcome::Success { value, .. } => {
            debug!(
                "Segment {} {} frame: {} people",
                frame.segment_index,
                frame.boundary,
                value.len()
            );
            Ok(FrameObservation {
                segment_index: frame.segment_index,
                boundary: frame.boundary,
                frame_index: frame.frame_index,
                width,
                height,
                people: value,
            })
        }
        RetryOutcome::Exhausted { error, attempts } | RetryOutcome::Rejected { error, attempts } => {
            Err(RegistryError::DetectionFailed {
                frame: frame.path.clone(),
                attempts,
                source: error,
            })
        }
        RetryOutcome::Cancelled { .. } => Err(RegistryError::Cancelled),
    }
}

/// One person being followed through the frames
struct Track {
    person_id: PersonId,
    position: String,
    sightings: Vec<Sighting>,
    appearances: Vec<Appearance>,
    last_seen: usize,
    last_region: Region,
}

impl Track {
    fn open(person_id: PersonId, observation: &FrameObservation, person: &DetectedPerson, order: usize) -> Self {
        let mut track = Self {
            person_id,
            position: describe_position(&person.region, observation.width),
            sightings: Vec::new(),
            appearances: Vec::new(),
            last_seen: order,
            last_region: person.region,
        };
        track.observe(observation, person, order);
        track
    }

    fn observe(&mut self, observation: &FrameObservation, person: &DetectedPerson, order: usize) {
        self.sightings.push(Sighting {
            segment_index: observation.segment_index,
            boundary: observation.boundary,
            frame_index: observation.frame_index,
            region: person.region,
        });
        self.appearances.push(person.appearance.clone());
        self.last_seen = order;
        self.last_region = person.region;
    }

    fn into_record(self) -> PersonRecord {
        let appearance = Appearance {
            gender: majority(self.appearances.iter().map(|a| a.gender.as_str())),
            age: majority(self.appearances.iter().map(|a| a.age.as_str())),
            skin: majority(self.appearances.iter().map(|a| a.skin.as_str())),
            hair: majority(self.appearances.iter().map(|a| a.hair.as_str())),
            clothing: majority(self.appearances.iter().map(|a| a.clothing.as_str())),
        };

        PersonRecord {
            person_id: self.person_id,
            description: appearance.description(),
            appearance,
            position: self.position,
            sightings: self.sightings,
        }
    }
}

/// Most frequent non-empty value; ties go to the earliest
fn majority<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for value in values.filter(|v| !v.trim().is_empty()) {
        match counts.iter_mut().find(|(s, _)| s.eq_ignore_ascii_case(value)) {
            Some(entry) => entry.1 += 1,
            None => counts.push((value, 1)),
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((value, count));
        }
    }
    best.map(|(v, _)| v.to_string()).unwrap_or_default()
}

/// Horizontal third of the frame a region sits in
pub fn describe_position(region: &Region, frame_width: u32) -> String {
    let (cx, _) = region.center();
    let third = frame_width as f64 / 3.0;
    if cx < third {
        "left third of the frame".to_string()
    } else if cx > 2.0 * third {
        "right third of the frame".to_string()
    } else {
        "center of the frame".to_string()
    }
}

fn tokens(value: &str) -> BTreeSet<String> {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

fn jaccard(a: &str, b: &str) -> Option<f64> {
    let a = tokens(a);
    let b = tokens(b);
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    Some(intersection / union)
}

/// Weighted token overlap of the appearance fields both sides describe
///
/// Returns 0.5 when no field can be compared.
pub fn appearance_similarity(a: &Appearance, b: &Appearance) -> f64 {
    let fields = [
        (0.35, a.clothing.as_str(), b.clothing.as_str()),
        (0.2, a.hair.as_str(), b.hair.as_str()),
        (0.2, a.gender.as_str(), b.gender.as_str()),
        (0.15, a.skin.as_str(), b.skin.as_str()),
        (0.1, a.age.as_str(), b.age.as_str()),
    ];

    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for (weight, x, y) in fields {
        if let Some(similarity) = jaccard(x, y) {
            total += weight * similarity;
            weight_sum += weight;
        }
    }

    if weight_sum > 0.0 {
        total / weight_sum
    } else {
        0.5
    }
}

/// 1 for identical centres, falling to 0 at half the frame diagonal
fn spatial_continuity(a: &Region, b: &Region, diagonal: f64) -> f64 {
    if diagonal <= 0.0 {
        return 0.0;
    }
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    let distance = ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt();
    (1.0 - distance / (0.5 * diagonal)).max(0.0)
}
