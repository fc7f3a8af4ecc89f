//! fal.ai queue API provider

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use vidloc_artifacts::download_to;
use vidloc_core::AspectRatio;

use crate::error::CollaboratorError;
use crate::http::{check_status, image_data_uri};
use crate::prompts::TEXT_REMOVAL_PROMPT;
use crate::provider::{EditRequest, GenerationProvider, ImageRequest, VideoRequest};

const FAL_QUEUE_URL: &str = "https://queue.fal.run";

/// Model selection and queue polling for fal.ai
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FalConfig {
    /// Image edit model (frame edits, text removal, portrait variants)
    pub edit_model: String,
    /// Text-to-image model (first reference portrait)
    pub image_model: String,
    /// First/last frame video model
    pub video_model: String,
    /// Seconds between status polls
    pub poll_interval_secs: u64,
    /// Status polls before an image job times out
    pub max_polls: u32,
    /// Status polls before a video job times out
    pub video_max_polls: u32,
    /// Video output resolution
    pub video_resolution: String,
}

impl Default for FalConfig {
    fn default() -> Self {
        Self {
            edit_model: "fal-ai/nano-banana/edit".to_string(),
            image_model: "fal-ai/nano-banana".to_string(),
            video_model: "fal-ai/veo3.1/first-last-frame-to-video".to_string(),
            poll_interval_secs: 5,
            max_polls: 60,
            video_max_polls: 120,
            video_resolution: "720p".to_string(),
        }
    }
}

/// fal.ai provider for image editing, image generation and video generation
pub struct FalProvider {
    client: Client,
    api_key: SecretString,
    config: FalConfig,
    base_url: String,
}

impl FalProvider {
    /// Create new fal.ai provider with default models
    pub fn new(api_key: SecretString) -> Self {
        Self::with_config(api_key, FalConfig::default())
    }

    /// Create with custom models and polling
    pub fn with_config(api_key: SecretString, config: FalConfig) -> Self {
        Self {
            client: Client::new(),
            api_key,
            config,
            base_url: FAL_QUEUE_URL.to_string(),
        }
    }

    /// Use a different queue endpoint
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn config(&self) -> &FalConfig {
        &self.config
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("Authorization", format!("Key {}", self.api_key.expose_secret()))
    }

    /// Submit a job to the queue
    async fn submit(&self, model: &str, arguments: &Value) -> Result<QueueTicket, CollaboratorError> {
        info!("Submitting request to model: {}", model);

        let response = self
            .authorized(self.client.post(format!("{}/{}", self.base_url, model)))
            .json(arguments)
            .send()
            .await?;
        let response = check_status(response, "fal.ai").await?;

        let ticket: QueueTicket = response
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;

        info!("Request submitted with ID: {}", ticket.request_id);
        Ok(ticket)
    }

    /// Poll a job until it completes
    async fn wait(&self, ticket: &QueueTicket, max_polls: u32) -> Result<(), CollaboratorError> {
        let interval = Duration::from_secs(self.config.poll_interval_secs);

        for attempt in 1..=max_polls {
            let response = self
                .authorized(self.client.get(&ticket.status_url))
                .send()
                .await?;
            let response = check_status(response, "fal.ai").await?;
            let status: QueueStatus = response
                .json()
                .await
                .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;

            debug!(
                "Status for request {}: {} (poll {}/{})",
                ticket.request_id, status.status, attempt, max_polls
            );

            match status.status.as_str() {
                "COMPLETED" => {
                    if let Some(error) = status.error {
                        return Err(CollaboratorError::JobFailed(format!(
                            "request {}: {}",
                            ticket.request_id, error
                        )));
                    }
                    info!("Request {} completed", ticket.request_id);
                    return Ok(());
                }
                "IN_QUEUE" | "IN_PROGRESS" => {}
                other => {
                    return Err(CollaboratorError::JobFailed(format!(
                        "request {} reported status {}",
                        ticket.request_id, other
                    )));
                }
            }

            tokio::time::sleep(interval).await;
        }

        warn!(
            "Request {} did not complete after {} polls",
            ticket.request_id, max_polls
        );
        Err(CollaboratorError::Timeout)
    }

    /// Fetch the result of a completed job
    async fn result(&self, ticket: &QueueTicket) -> Result<Value, CollaboratorError> {
        let response = self
            .authorized(self.client.get(&ticket.response_url))
            .send()
            .await?;
        let response = check_status(response, "fal.ai").await?;

        response
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))
    }

    /// Submit, poll and fetch
    async fn run(&self, model: &str, arguments: &Value, max_polls: u32) -> Result<Value, CollaboratorError> {
        let ticket = self.submit(model, arguments).await?;
        self.wait(&ticket, max_polls).await?;
        self.result(&ticket).await
    }

    /// Run an image model and save its first image
    async fn run_image(&self, model: &str, arguments: &Value, output: &Path) -> Result<PathBuf, CollaboratorError> {
        let result = self.run(model, arguments, self.config.max_polls).await?;
        let url = image_url(&result)?;
        download_to(&self.client, url, output).await?;
        Ok(output.to_path_buf())
    }
}

impl GenerationProvider for FalProvider {
    async fn generate_image(&self, request: &ImageRequest, output: &Path) -> Result<PathBuf, CollaboratorError> {
        let arguments = json!({
            "prompt": request.prompt,
            "aspect_ratio": request.aspect_ratio.as_str(),
            "num_images": 1,
            "output_format": "png",
        });
        self.run_image(&self.config.image_model, &arguments, output).await
    }

    async fn edit_image(&self, request: &EditRequest, output: &Path) -> Result<PathBuf, CollaboratorError> {
        let mut image_urls = Vec::with_capacity(request.references.len() + 1);
        image_urls.push(image_data_uri(&request.image).await?);
        for reference in &request.references {
            image_urls.push(image_data_uri(reference).await?);
        }

        let arguments = json!({
            "prompt": request.instruction,
            "image_urls": image_urls,
            "aspect_ratio": request.aspect_ratio.as_str(),
            "output_format": "png",
        });
        self.run_image(&self.config.edit_model, &arguments, output).await
    }

    async fn generate_video(&self, request: &VideoRequest, output: &Path) -> Result<PathBuf, CollaboratorError> {
        let arguments = json!({
            "prompt": request.prompt,
            "first_frame_url": image_data_uri(&request.first_frame).await?,
            "last_frame_url": image_data_uri(&request.last_frame).await?,
            "duration": format!("{}s", request.duration_whole_secs()),
            "aspect_ratio": request.aspect_ratio.as_str(),
            "resolution": self.config.video_resolution,
            "generate_audio": false,
        });

        let result = self
            .run(&self.config.video_model, &arguments, self.config.video_max_polls)
            .await?;
        let url = video_url(&result)?;
        download_to(&self.client, url, output).await?;
        Ok(output.to_path_buf())
    }

    async fn remove_text(&self, image: &Path, output: &Path) -> Result<PathBuf, CollaboratorError> {
        let (width, height) = image::image_dimensions(image)?;
        let arguments = json!({
            "prompt": TEXT_REMOVAL_PROMPT,
            "image_urls": [image_data_uri(image).await?],
            "aspect_ratio": AspectRatio::from_dimensions(width, height).as_str(),
            "output_format": "png",
        });
        self.run_image(&self.config.edit_model, &arguments, output).await
    }

    fn name(&self) -> &'static str {
        "fal.ai"
    }
}

/// URL of the first image in an image model result
fn image_url(result: &Value) -> Result<&str, CollaboratorError> {
    result
        .get("images")
        .and_then(|images| images.get(0))
        .and_then(|image| image.get("url"))
        .and_then(Value::as_str)
        .ok_or_else(|| CollaboratorError::InvalidResponse("No images in result".to_string()))
}

/// URL of the clip in a video model result
fn video_url(result: &Value) -> Result<&str, CollaboratorError> {
    result
        .get("video")
        .and_then(|video| video.get("url"))
        .and_then(Value::as_str)
        .ok_or_else(|| CollaboratorError::InvalidResponse("No video in result".to_string()))
}

#[derive(Debug, Deserialize)]
struct QueueTicket {
    request_id: String,
    status_url: String,
    response_url: String,
}

#[derive(Debug, Deserialize)]
struct QueueStatus {
    status: String,
    #[serde(default)]
    error: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "fal-ai/nano-banana";
    const REQUEST_PATH: &str = "/fal-ai/nano-banana/requests/abc-123";

    fn create_test_provider(server: &MockServer) -> FalProvider {
        let config = FalConfig {
            poll_interval_secs: 0,
            max_polls: 3,
            ..FalConfig::default()
        };
        FalProvider::with_config(SecretString::new("test-key".to_string()), config).with_base_url(&server.uri())
    }

    fn create_test_request() -> ImageRequest {
        ImageRequest {
            prompt: "Portrait of a Korean man in his 20s".to_string(),
            aspect_ratio: AspectRatio::Square,
        }
    }

    fn status_body(status: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"status": status}))
    }

    /// Queue ticket, result and image file for one job; status polls are mounted per test
    async fn mount_test_job(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(format!("/{}", MODEL)))
            .and(header("Authorization", "Key test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "request_id": "abc-123",
                "status_url": format!("{}{}/status", server.uri(), REQUEST_PATH),
                "response_url": format!("{}{}", server.uri(), REQUEST_PATH),
            })))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(REQUEST_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "images": [{"url": format!("{}/files/portrait.png", server.uri())}]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/portrait.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"portrait-bytes".to_vec()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_completed_job_is_downloaded() {
        let server = MockServer::start().await;
        mount_test_job(&server).await;
        Mock::given(method("GET"))
            .and(path(format!("{}/status", REQUEST_PATH)))
            .respond_with(status_body("COMPLETED"))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let output = temp.path().join("portraits/front.png");
        let provider = create_test_provider(&server);
        let saved = provider.generate_image(&create_test_request(), &output).await.unwrap();

        assert_eq!(saved, output);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"portrait-bytes");
    }

    #[tokio::test]
    async fn test_job_polled_until_completed() {
        let server = MockServer::start().await;
        mount_test_job(&server).await;
        Mock::given(method("GET"))
            .and(path(format!("{}/status", REQUEST_PATH)))
            .respond_with(status_body("IN_PROGRESS"))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/status", REQUEST_PATH)))
            .respond_with(status_body("COMPLETED"))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let output = temp.path().join("front.png");
        let provider = create_test_provider(&server);
        provider.generate_image(&create_test_request(), &output).await.unwrap();

        assert!(output.exists());
    }

    #[tokio::test]
    async fn test_job_never_completing_times_out() {
        let server = MockServer::start().await;
        mount_test_job(&server).await;
        Mock::given(method("GET"))
            .and(path(format!("{}/status", REQUEST_PATH)))
            .respond_with(status_body("IN_QUEUE"))
            .expect(3)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let provider = create_test_provider(&server);
        let error = provider
            .generate_image(&create_test_request(), &temp.path().join("front.png"))
            .await
            .unwrap_err();

        assert!(matches!(error, CollaboratorError::Timeout));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_completed_with_error_fails_job() {
        let server = MockServer::start().await;
        mount_test_job(&server).await;
        Mock::given(method("GET"))
            .and(path(format!("{}/status", REQUEST_PATH)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "COMPLETED", "error": "content policy"})),
            )
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let provider = create_test_provider(&server);
        let error = provider
            .generate_image(&create_test_request(), &temp.path().join("front.png"))
            .await
            .unwrap_err();

        match error {
            CollaboratorError::JobFailed(message) => assert!(message.contains("content policy")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{}", MODEL)))
            .respond_with(ResponseTemplate::new(422).set_body_string("prompt is required"))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let provider = create_test_provider(&server);
        let error = provider
            .generate_image(&create_test_request(), &temp.path().join("front.png"))
            .await
            .unwrap_err();

        match &error {
            CollaboratorError::RequestFailed(message) => assert!(message.contains("prompt is required")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_rejected_key_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{}", MODEL)))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let provider = create_test_provider(&server);
        let error = provider
            .generate_image(&create_test_request(), &temp.path().join("front.png"))
            .await
            .unwrap_err();

        assert!(matches!(error, CollaboratorError::ConfigError(_)));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{}", MODEL)))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let provider = create_test_provider(&server);
        let error = provider
            .generate_image(&create_test_request(), &temp.path().join("front.png"))
            .await
            .unwrap_err();

        match &error {
            CollaboratorError::ServerError { status, message } => {
                assert_eq!(*status, 503);
                assert_eq!(message, "overloaded");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_rate_limit_reports_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{}", MODEL)))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let provider = create_test_provider(&server);
        let error = provider
            .generate_image(&create_test_request(), &temp.path().join("front.png"))
            .await
            .unwrap_err();

        assert!(matches!(error, CollaboratorError::RateLimited(7)));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_image_url_extraction() {
        let result = json!({
            "images": [{"url": "https://fal.media/files/a.png", "content_type": "image/png"}],
            "description": ""
        });
        assert_eq!(image_url(&result).unwrap(), "https://fal.media/files/a.png");

        let empty = json!({"images": []});
        assert!(matches!(image_url(&empty), Err(CollaboratorError::InvalidResponse(_))));
    }

    #[test]
    fn test_video_url_extraction() {
        let result = json!({"video": {"url": "https://fal.media/files/clip.mp4"}});
        assert_eq!(video_url(&result).unwrap(), "https://fal.media/files/clip.mp4");
        assert!(video_url(&json!({})).is_err());
    }

    #[test]
    fn test_queue_ticket_parsing() {
        let body = r#"{
            "request_id": "abc-123",
            "response_url": "https://queue.fal.run/fal-ai/nano-banana/requests/abc-123",
            "status_url": "https://queue.fal.run/fal-ai/nano-banana/requests/abc-123/status",
            "cancel_url": "https://queue.fal.run/fal-ai/nano-banana/requests/abc-123/cancel"
        }"#;
        let ticket: QueueTicket = serde_json::from_str(body).unwrap();
        assert_eq!(ticket.request_id, "abc-123");
        assert!(ticket.status_url.ends_with("/status"));

        let status: QueueStatus = serde_json::from_str(r#"{"status": "IN_QUEUE", "queue_position": 2}"#).unwrap();
        assert_eq!(status.status, "IN_QUEUE");
        assert!(status.error.is_none());
    }

    #[test]
    fn test_default_models() {
        let config = FalConfig::default();
        assert_eq!(config.edit_model, "fal-ai/nano-banana/edit");
        assert_eq!(config.video_model, "fal-ai/veo3.1/first-last-frame-to-video");
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.max_polls, 60);
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let provider = FalProvider::new(SecretString::new("key".to_string())).with_base_url("http://localhost:9000/");
        assert_eq!(provider.base_url, "http://localhost:9000");
    }
}
