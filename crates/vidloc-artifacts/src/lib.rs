//! Intermediate artifacts for vidloc
//!
//! Run work directories, the step cache used as recovery points, and
//! streaming download of collaborator outputs.

pub mod cache;
pub mod download;
pub mod error;
pub mod workdir;

pub use cache::{params_digest, steps, Artifact, ArtifactCache, SourceFingerprint};
pub use download::{decode_data_uri, download_to, encode_data_uri};
pub use error::{CacheError, DownloadError};
pub use workdir::WorkDir;
