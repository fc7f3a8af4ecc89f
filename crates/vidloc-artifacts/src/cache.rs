//! Step cache
//!
//! Each pipeline step can persist its result as JSON, keyed by a fingerprint
//! of the source video, the step name and a digest of the step's parameters.
//! A re-run with the same inputs picks completed steps up from here instead
//! of repeating collaborator calls.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::CacheError;

/// Step names used as cache namespaces
pub mod steps {
    pub const SEGMENTS: &str = "segments";
    pub const TEXT_LAYER: &str = "text_layer";
    pub const CLEANED_FRAMES: &str = "cleaned_frames";
    pub const REGISTRY: &str = "registry";
    pub const IDENTITIES: &str = "identities";
    pub const SEGMENT_RESULT: &str = "segment_result";

    pub const ALL: [&str; 6] = [
        SEGMENTS,
        TEXT_LAYER,
        CLEANED_FRAMES,
        REGISTRY,
        IDENTITIES,
        SEGMENT_RESULT,
    ];
}

/// A cacheable step result
pub trait Artifact: Serialize + DeserializeOwned {
    /// Files the artifact points at; a cached entry is discarded if any is gone
    fn referenced_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Identity of a source video: path, modification time and size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFingerprint(String);

impl SourceFingerprint {
    /// Fingerprint a file, or a directory by its direct entries
    pub async fn of(path: &Path) -> Result<Self, CacheError> {
        if !path.exists() {
            return Err(CacheError::SourceNotFound(path.display().to_string()));
        }

        let mut hasher = Sha256::new();
        let canonical = fs::canonicalize(path).await?;
        hasher.update(canonical.to_string_lossy().as_bytes());
        hash_metadata(&mut hasher, path).await?;

        if path.is_dir() {
            let mut names = Vec::new();
            let mut entries = fs::read_dir(path).await?;
            while let Some(entry) = entries.next_entry().await? {
                names.push(entry.path());
            }
            names.sort();
            for name in names {
                hasher.update(name.to_string_lossy().as_bytes());
                hash_metadata(&mut hasher, &name).await?;
            }
        }

        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

async fn hash_metadata(hasher: &mut Sha256, path: &Path) -> Result<(), CacheError> {
    let metadata = fs::metadata(path).await?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    hasher.update(modified.to_le_bytes());
    hasher.update(metadata.len().to_le_bytes());
    Ok(())
}

/// SHA-256 hex digest of a parameter set
pub fn params_digest<T: Serialize>(params: &T) -> Result<String, CacheError> {
    let json = serde_json::to_vec(params)?;
    Ok(hex::encode(Sha256::digest(&json)))
}

/// JSON step cache
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    /// Cache directory; `None` disables caching
    cache_dir: Option<PathBuf>,
}

impl ArtifactCache {
    /// Cache in the user cache directory
    pub fn new() -> Self {
        let cache_dir = ProjectDirs::from("com", "vidloc", "Vidloc").map(|dirs| dirs.cache_dir().join("artifacts"));
        Self { cache_dir }
    }

    /// Cache in a custom directory
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir: Some(cache_dir),
        }
    }

    /// Disable caching
    pub fn disabled() -> Self {
        Self { cache_dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_dir.is_some()
    }

    pub fn cache_directory(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Cache path for a step result
    fn entry_path(&self, source: &SourceFingerprint, step: &str, params: &str) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| {
            let mut hasher = Sha256::new();
            hasher.update(source.as_str().as_bytes());
            hasher.update(step.as_bytes());
            hasher.update(params.as_bytes());
            dir.join(step).join(format!("{}.json", hex::encode(hasher.finalize())))
        })
    }

    /// Load a step result, if a valid one is cached
    pub async fn load<A: Artifact>(
        &self,
        source: &SourceFingerprint,
        step: &str,
        params: &str,
    ) -> Result<Option<A>, CacheError> {
        let path = match self.entry_path(source, step, params) {
            Some(p) => p,
            None => return Ok(None),
        };

        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read_to_string(&path).await?;
        let artifact: A = match serde_json::from_str(&data) {
            Ok(a) => a,
            Err(e) => {
                warn!("Discarding unreadable {} cache entry: {}", step, e);
                fs::remove_file(&path).await?;
                return Ok(None);
            }
        };

        if let Some(missing) = artifact.referenced_paths().into_iter().find(|p| !p.exists()) {
            debug!(
                "Discarding {} cache entry, {} no longer exists",
                step,
                missing.display()
            );
            fs::remove_file(&path).await?;
            return Ok(None);
        }

        debug!("Loaded {} from cache", step);
        Ok(Some(artifact))
    }

    /// Store a step result
    pub async fn save<A: Artifact>(
        &self,
        source: &SourceFingerprint,
        step: &str,
        params: &str,
        artifact: &A,
    ) -> Result<(), CacheError> {
        let path = match self.entry_path(source, step, params) {
            Some(p) => p,
            None => return Ok(()),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_string(artifact)?;
        fs::write(&path, data).await?;
        Ok(())
    }

    /// Clear one step, or the whole cache when `step` is `None`
    pub async fn clear(&self, step: Option<&str>) -> Result<(), CacheError> {
        let dir = match (&self.cache_dir, step) {
            (None, _) => return Ok(()),
            (Some(dir), Some(step)) => dir.join(step),
            (Some(dir), None) => dir.clone(),
        };

        if dir.exists() {
            fs::remove_dir_all(&dir).await?;
            info!("Cleared cache at {}", dir.display());
        }
        Ok(())
    }
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestArtifact {
        files: Vec<PathBuf>,
        value: u32,
    }

    impl Artifact for TestArtifact {
        fn referenced_paths(&self) -> Vec<PathBuf> {
            self.files.clone()
        }
    }

    async fn create_test_source(dir: &Path) -> PathBuf {
        let path = dir.join("source.mp4");
        fs::write(&path, b"video").await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let source = create_test_source(temp.path()).await;
        let fingerprint = SourceFingerprint::of(&source).await.unwrap();
        let cache = ArtifactCache::with_cache_dir(temp.path().join("cache"));

        let artifact = TestArtifact {
            files: vec![source.clone()],
            value: 42,
        };
        cache.save(&fingerprint, steps::SEGMENTS, "p1", &artifact).await.unwrap();

        let loaded: Option<TestArtifact> = cache.load(&fingerprint, steps::SEGMENTS, "p1").await.unwrap();
        assert_eq!(loaded, Some(artifact));

        let other: Option<TestArtifact> = cache.load(&fingerprint, steps::SEGMENTS, "p2").await.unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_missing_reference_invalidates_entry() {
        let temp = TempDir::new().unwrap();
        let source = create_test_source(temp.path()).await;
        let fingerprint = SourceFingerprint::of(&source).await.unwrap();
        let cache = ArtifactCache::with_cache_dir(temp.path().join("cache"));

        let frame = temp.path().join("frame.png");
        fs::write(&frame, b"png").await.unwrap();
        let artifact = TestArtifact {
            files: vec![frame.clone()],
            value: 1,
        };
        cache.save(&fingerprint, steps::REGISTRY, "p", &artifact).await.unwrap();

        fs::remove_file(&frame).await.unwrap();
        let loaded: Option<TestArtifact> = cache.load(&fingerprint, steps::REGISTRY, "p").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_fingerprint_changes_with_content() {
        let temp = TempDir::new().unwrap();
        let source = create_test_source(temp.path()).await;
        let before = SourceFingerprint::of(&source).await.unwrap();

        fs::write(&source, b"another video").await.unwrap();
        let after = SourceFingerprint::of(&source).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_clear_single_step() {
        let temp = TempDir::new().unwrap();
        let source = create_test_source(temp.path()).await;
        let fingerprint = SourceFingerprint::of(&source).await.unwrap();
        let cache = ArtifactCache::with_cache_dir(temp.path().join("cache"));

        let artifact = TestArtifact { files: vec![], value: 7 };
        cache.save(&fingerprint, steps::SEGMENTS, "p", &artifact).await.unwrap();
        cache.save(&fingerprint, steps::IDENTITIES, "p", &artifact).await.unwrap();

        cache.clear(Some(steps::SEGMENTS)).await.unwrap();

        let segments: Option<TestArtifact> = cache.load(&fingerprint, steps::SEGMENTS, "p").await.unwrap();
        let identities: Option<TestArtifact> = cache.load(&fingerprint, steps::IDENTITIES, "p").await.unwrap();
        assert!(segments.is_none());
        assert!(identities.is_some());
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let temp = TempDir::new().unwrap();
        let source = create_test_source(temp.path()).await;
        let fingerprint = SourceFingerprint::of(&source).await.unwrap();
        let cache = ArtifactCache::disabled();

        let artifact = TestArtifact { files: vec![], value: 7 };
        cache.save(&fingerprint, steps::SEGMENTS, "p", &artifact).await.unwrap();
        let loaded: Option<TestArtifact> = cache.load(&fingerprint, steps::SEGMENTS, "p").await.unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_params_digest_is_stable() {
        let a = params_digest(&(8.0f64, "fixed")).unwrap();
        let b = params_digest(&(8.0f64, "fixed")).unwrap();
        let c = params_digest(&(5.0f64, "fixed")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
