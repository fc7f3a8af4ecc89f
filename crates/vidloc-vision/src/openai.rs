//! OpenAI chat completions provider for person detection and persona design

use std::path::Path;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vidloc_core::{Appearance, DetectedPerson, PersonRecord, Persona, Region, TransformationTheme};

use crate::error::CollaboratorError;
use crate::http::{check_status, image_data_uri};
use crate::prompts;
use crate::provider::PerceptionProvider;

const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";

/// OpenAI vision provider
pub struct OpenAiProvider {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    /// Create new OpenAI provider
    pub fn new(api_key: SecretString) -> Self {
        Self::with_model(api_key, DEFAULT_MODEL)
    }

    /// Create with custom model
    pub fn with_model(api_key: SecretString, model: &str) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: model.to_string(),
            base_url: OPENAI_API_URL.to_string(),
        }
    }

    /// Use a different API endpoint (compatible servers)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Send a chat completion request, returning the message text
    async fn send_chat(&self, content: ChatContent, temperature: f32) -> Result<String, CollaboratorError> {
        let request = ChatRequest {
            model: &self.model,
            max_tokens: 2048,
            temperature,
            response_format: ResponseFormat { kind: "json_object" },
            messages: vec![ChatMessage { role: "user", content }],
        };

        debug!("Sending request to OpenAI API");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;
        let response = check_status(response, "OpenAI").await?;

        let response: ChatResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CollaboratorError::InvalidResponse("Empty response".to_string()))
    }
}

impl PerceptionProvider for OpenAiProvider {
    async fn detect_people(&self, image: &Path) -> Result<Vec<DetectedPerson>, CollaboratorError> {
        let (width, height) = image::image_dimensions(image)?;
        let content = ChatContent::Parts(vec![
            ContentPart::Text {
                text: prompts::build_detection_prompt(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image_data_uri(image).await?,
                },
            },
        ]);

        let response = self.send_chat(content, 0.0).await?;
        let people = parse_detection_response(&response, width, height)?;

        debug!("Detected {} people in {}", people.len(), image.display());
        Ok(people)
    }

    async fn design_personas(
        &self,
        originals: &[PersonRecord],
        theme: &TransformationTheme,
    ) -> Result<Vec<Persona>, CollaboratorError> {
        if originals.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "Designing {} personas for '{}' with OpenAI (model: {})",
            originals.len(),
            theme,
            self.model
        );

        let prompt = prompts::build_persona_prompt(originals, theme);
        let response = self.send_chat(ChatContent::Text(prompt), 0.7).await?;
        parse_persona_response(&response, originals.len())
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/models/{}", self.base_url, self.model))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "OpenAI"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Cut a JSON object out of model output that may carry code fences or prose
fn extract_json_object(response: &str) -> &str {
    match (response.find('{'), response.rfind('}')) {
        (Some(start), Some(end)) if end > start => &response[start..=end],
        _ => response.trim(),
    }
}

/// Parse detections and convert bounding boxes to pixel regions
fn parse_detection_response(
    response: &str,
    width: u32,
    height: u32,
) -> Result<Vec<DetectedPerson>, CollaboratorError> {
    let parsed: PeopleResponse<DetectionItem> = serde_json::from_str(extract_json_object(response))
        .map_err(|e| CollaboratorError::ParseError(format!("Failed to parse detections: {}", e)))?;

    Ok(parsed
        .people
        .into_iter()
        .filter_map(|item| {
            bbox_to_region(item.bbox, width, height).map(|region| DetectedPerson {
                region,
                appearance: item.appearance,
            })
        })
        .collect())
}

/// Normalized (or, if any coordinate exceeds 1, pixel) box to a clamped region
fn bbox_to_region(bbox: [f64; 4], width: u32, height: u32) -> Option<Region> {
    let normalized = bbox.iter().all(|v| *v <= 1.0);
    let (sx, sy) = if normalized {
        (width as f64, height as f64)
    } else {
        (1.0, 1.0)
    };

    let x0 = (bbox[0].min(bbox[2]) * sx).floor().clamp(0.0, width as f64) as u32;
    let y0 = (bbox[1].min(bbox[3]) * sy).floor().clamp(0.0, height as f64) as u32;
    let x1 = (bbox[0].max(bbox[2]) * sx).ceil().clamp(0.0, width as f64) as u32;
    let y1 = (bbox[1].max(bbox[3]) * sy).ceil().clamp(0.0, height as f64) as u32;

    let region = Region::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0));
    (!region.is_empty()).then_some(region)
}

/// Parse personas, rejecting a count that does not match the originals
fn parse_persona_response(response: &str, expected: usize) -> Result<Vec<Persona>, CollaboratorError> {
    let parsed: PeopleResponse<PersonaItem> = serde_json::from_str(extract_json_object(response))
        .map_err(|e| CollaboratorError::ParseError(format!("Failed to parse personas: {}", e)))?;

    if parsed.people.len() != expected {
        return Err(CollaboratorError::ParseError(format!(
            "Expected {} personas, got {}",
            expected,
            parsed.people.len()
        )));
    }

    Ok(parsed
        .people
        .into_iter()
        .map(|item| Persona {
            appearance: item.appearance,
            casting_notes: item.casting_notes,
        })
        .collect())
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: ChatContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct PeopleResponse<T> {
    #[serde(default = "Vec::new")]
    people: Vec<T>,
}

#[derive(Deserialize)]
struct DetectionItem {
    bbox: [f64; 4],
    #[serde(flatten)]
    appearance: Appearance,
}

#[derive(Deserialize)]
struct PersonaItem {
    #[serde(flatten)]
    appearance: Appearance,
    #[serde(default)]
    casting_notes: String,
}
