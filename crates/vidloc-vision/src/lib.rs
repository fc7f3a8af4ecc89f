//! Collaborator boundary for vidloc
//!
//! Person detection and persona design through an OpenAI vision model, and
//! image editing, image generation and video generation through the fal.ai
//! queue API. The pipeline only sees the provider traits.

pub mod error;
mod http;
pub mod provider;
pub mod prompts;

#[cfg(feature = "fal")]
pub mod fal;
#[cfg(feature = "openai")]
pub mod openai;

pub use error::CollaboratorError;
pub use provider::{
    EditRequest, GenerationProvider, ImageRequest, LocalGenerationProvider, LocalPerceptionProvider,
    PerceptionProvider, VideoRequest,
};

#[cfg(feature = "fal")]
pub use fal::{FalConfig, FalProvider};
#[cfg(feature = "openai")]
pub use openai::OpenAiProvider;
