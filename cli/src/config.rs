//! Environment configuration
//!
//! API keys and backend overrides come from the process environment, after
//! `.env` has been loaded. Pipeline tuning lives in the JSON config file.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;
use vidloc_core::media::FfmpegConfig;
use vidloc_vision::{FalConfig, FalProvider, OpenAiProvider};

pub const FAL_KEY: &str = "FAL_KEY";
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";

/// Settings read from the environment
pub struct Settings {
    fal_key: SecretString,
    openai_key: SecretString,
    pub openai_model: Option<String>,
    pub openai_base_url: Option<String>,
    pub fal: FalConfig,
    pub fal_base_url: Option<String>,
    pub ffmpeg: FfmpegConfig,
    pub work_dir: Option<PathBuf>,
}

impl Settings {
    /// Load `.env` (if any) and read the process environment
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from a variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let fal_key = required(&lookup, FAL_KEY)?;
        let openai_key = required(&lookup, OPENAI_API_KEY)?;

        let mut fal = FalConfig::default();
        if let Some(model) = lookup("VIDLOC_FAL_EDIT_MODEL") {
            fal.edit_model = model;
        }
        if let Some(model) = lookup("VIDLOC_FAL_IMAGE_MODEL") {
            fal.image_model = model;
        }
        if let Some(model) = lookup("VIDLOC_FAL_VIDEO_MODEL") {
            fal.video_model = model;
        }
        if let Some(value) = lookup("VIDLOC_FAL_POLL_SECS") {
            fal.poll_interval_secs = value
                .parse()
                .with_context(|| format!("VIDLOC_FAL_POLL_SECS is not a number: {}", value))?;
        }

        let mut ffmpeg = FfmpegConfig::default();
        if let Some(path) = lookup("VIDLOC_FFMPEG") {
            ffmpeg.ffmpeg = PathBuf::from(path);
        }
        if let Some(path) = lookup("VIDLOC_FFPROBE") {
            ffmpeg.ffprobe = PathBuf::from(path);
        }

        Ok(Self {
            fal_key,
            openai_key,
            openai_model: lookup("VIDLOC_OPENAI_MODEL"),
            openai_base_url: lookup("VIDLOC_OPENAI_BASE_URL"),
            fal,
            fal_base_url: lookup("VIDLOC_FAL_BASE_URL"),
            ffmpeg,
            work_dir: lookup("VIDLOC_WORK_DIR").map(PathBuf::from),
        })
    }

    /// Vision model used for detection and persona design
    pub fn perception(&self) -> OpenAiProvider {
        let provider = match &self.openai_model {
            Some(model) => OpenAiProvider::with_model(self.openai_key.clone(), model),
            None => OpenAiProvider::new(self.openai_key.clone()),
        };
        match &self.openai_base_url {
            Some(url) => provider.with_base_url(url),
            None => provider,
        }
    }

    /// Hosted image and video models
    pub fn generation(&self) -> FalProvider {
        let provider = FalProvider::with_config(self.fal_key.clone(), self.fal.clone());
        match &self.fal_base_url {
            Some(url) => provider.with_base_url(url),
            None => provider,
        }
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<SecretString> {
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .map(SecretString::new)
        .ok_or_else(|| anyhow!("{} is not set (export it or add it to .env)", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn create_test_env(extra: &[(&str, &str)]) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = [(FAL_KEY, "fal-secret"), (OPENAI_API_KEY, "sk-secret")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (k, v) in extra {
            env.insert(k.to_string(), v.to_string());
        }
        env
    }

    #[test]
    fn test_defaults_without_overrides() {
        let env = create_test_env(&[]);
        let settings = Settings::from_lookup(|name| env.get(name).cloned()).unwrap();

        assert_eq!(settings.fal_key.expose_secret(), "fal-secret");
        assert_eq!(settings.openai_key.expose_secret(), "sk-secret");
        assert_eq!(settings.fal.video_model, FalConfig::default().video_model);
        assert_eq!(settings.ffmpeg.ffmpeg, PathBuf::from("ffmpeg"));
        assert!(settings.openai_model.is_none());
        assert!(settings.work_dir.is_none());
    }

    #[test]
    fn test_overrides_applied() {
        let env = create_test_env(&[
            ("VIDLOC_FAL_VIDEO_MODEL", "fal-ai/kling-video/first-last"),
            ("VIDLOC_FAL_POLL_SECS", "2"),
            ("VIDLOC_OPENAI_MODEL", "gpt-4.1"),
            ("VIDLOC_FFMPEG", "/opt/ffmpeg/bin/ffmpeg"),
            ("VIDLOC_WORK_DIR", "/tmp/vidloc"),
        ]);
        let settings = Settings::from_lookup(|name| env.get(name).cloned()).unwrap();

        assert_eq!(settings.fal.video_model, "fal-ai/kling-video/first-last");
        assert_eq!(settings.fal.poll_interval_secs, 2);
        assert_eq!(settings.openai_model.as_deref(), Some("gpt-4.1"));
        assert_eq!(settings.ffmpeg.ffmpeg, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(settings.ffmpeg.ffprobe, PathBuf::from("ffprobe"));
        assert_eq!(settings.work_dir, Some(PathBuf::from("/tmp/vidloc")));
    }

    #[test]
    fn test_missing_key_is_error() {
        let mut env = create_test_env(&[]);
        env.remove(FAL_KEY);
        let err = Settings::from_lookup(|name| env.get(name).cloned()).err().unwrap();
        assert!(err.to_string().contains(FAL_KEY));
    }

    #[test]
    fn test_blank_key_is_error() {
        let env = create_test_env(&[(OPENAI_API_KEY, "  ")]);
        assert!(Settings::from_lookup(|name| env.get(name).cloned()).is_err());
    }

    #[test]
    fn test_bad_poll_interval_is_error() {
        let env = create_test_env(&[("VIDLOC_FAL_POLL_SECS", "soon")]);
        assert!(Settings::from_lookup(|name| env.get(name).cloned()).is_err());
    }
}
