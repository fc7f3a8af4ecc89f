//! Run work directory layout

use std::path::{Path, PathBuf};

use tokio::fs;
use vidloc_core::Boundary;

const SUBDIRECTORIES: [&str; 9] = [
    "segments",
    "frames",
    "text",
    "cleaned",
    "identities",
    "edited",
    "clips",
    "timeline",
    "output",
];

/// Directory holding every intermediate artifact of one run
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Create the layout under `root`
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self, std::io::Error> {
        let root = root.into();
        for sub in SUBDIRECTORIES {
            fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Source clips cut per segment
    pub fn segments_dir(&self) -> PathBuf {
        self.root.join("segments")
    }

    /// Source boundary frames
    pub fn frames_dir(&self) -> PathBuf {
        self.root.join("frames")
    }

    pub fn text_dir(&self) -> PathBuf {
        self.root.join("text")
    }

    /// Text-removed boundary frames
    pub fn cleaned_dir(&self) -> PathBuf {
        self.root.join("cleaned")
    }

    pub fn identities_dir(&self) -> PathBuf {
        self.root.join("identities")
    }

    pub fn edited_dir(&self) -> PathBuf {
        self.root.join("edited")
    }

    /// Generated and conformed clips
    pub fn clips_dir(&self) -> PathBuf {
        self.root.join("clips")
    }

    pub fn timeline_dir(&self) -> PathBuf {
        self.root.join("timeline")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn text_layer(&self) -> PathBuf {
        self.text_dir().join("layer.png")
    }

    /// Original clip of a segment, used for substitution
    pub fn source_clip(&self, index: usize, extension: &str) -> PathBuf {
        self.segments_dir().join(with_extension(format!("segment_{:03}", index), extension))
    }

    /// Raw collaborator output for a segment
    pub fn generated_clip(&self, index: usize, extension: &str) -> PathBuf {
        self.clips_dir().join(with_extension(format!("generated_{:03}", index), extension))
    }

    /// Generated clip after frame rate and resolution conforming
    pub fn conformed_clip(&self, index: usize, extension: &str) -> PathBuf {
        self.clips_dir().join(with_extension(format!("segment_{:03}", index), extension))
    }

    pub fn cleaned_frame(&self, index: usize, boundary: Boundary) -> PathBuf {
        self.cleaned_dir().join(format!("segment_{:03}_{}.png", index, boundary))
    }

    pub fn edited_frame(&self, index: usize, boundary: Boundary) -> PathBuf {
        self.edited_dir().join(format!("segment_{:03}_{}.png", index, boundary))
    }

    /// Reference portrait `number` (0-based) of a person
    pub fn portrait(&self, person_id: &str, number: usize) -> PathBuf {
        self.identities_dir()
            .join(person_id)
            .join(format!("portrait_{}.png", number))
    }

    /// Concatenated timeline before text reintegration
    pub fn timeline(&self, extension: &str) -> PathBuf {
        self.timeline_dir().join(with_extension("timeline".to_string(), extension))
    }

    /// Scratch directory for unpacked timeline frames
    pub fn timeline_frames_dir(&self) -> PathBuf {
        self.timeline_dir().join("frames")
    }

    /// Reintegrated video before audio muxing
    pub fn composited(&self, extension: &str) -> PathBuf {
        self.output_dir().join(with_extension("composited".to_string(), extension))
    }
}

/// Append `extension` unless it is empty (directory-backed media)
fn with_extension(name: String, extension: &str) -> String {
    if extension.is_empty() {
        name
    } else {
        format!("{}.{}", name, extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_lays_out_subdirectories() {
        let temp = TempDir::new().unwrap();
        let work = WorkDir::create(temp.path().join("run")).await.unwrap();

        for sub in SUBDIRECTORIES {
            assert!(work.root().join(sub).is_dir(), "missing {}", sub);
        }
    }

    #[test]
    fn test_artifact_paths() {
        let work = WorkDir {
            root: PathBuf::from("/work/run"),
        };

        assert_eq!(
            work.source_clip(3, "mp4"),
            PathBuf::from("/work/run/segments/segment_003.mp4")
        );
        assert_eq!(
            work.conformed_clip(12, ""),
            PathBuf::from("/work/run/clips/segment_012")
        );
        assert_eq!(
            work.edited_frame(0, Boundary::End),
            PathBuf::from("/work/run/edited/segment_000_end.png")
        );
        assert_eq!(
            work.portrait("person_002", 1),
            PathBuf::from("/work/run/identities/person_002/portrait_1.png")
        );
    }
}
