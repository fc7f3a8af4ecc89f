//! HTTP helpers shared by the providers

use std::path::Path;

use reqwest::Response;
use tracing::warn;
use vidloc_artifacts::encode_data_uri;

use crate::error::CollaboratorError;

/// Map error statuses to collaborator errors
pub async fn check_status(response: Response, service: &str) -> Result<Response, CollaboratorError> {
    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);
        return Err(CollaboratorError::RateLimited(retry_after));
    }

    if status.is_server_error() {
        let error_text = response.text().await.unwrap_or_default();
        warn!("{} server error: {} - {}", service, status, error_text);
        return Err(CollaboratorError::ServerError {
            status: status.as_u16(),
            message: error_text,
        });
    }

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(CollaboratorError::ConfigError(format!(
            "{} rejected the API key ({})",
            service, status
        )));
    }

    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        warn!("{} API error: {} - {}", service, status, error_text);
        return Err(CollaboratorError::RequestFailed(format!("{}: {}", status, error_text)));
    }

    Ok(response)
}

/// Read an image file as a data URI
pub async fn image_data_uri(path: &Path) -> Result<String, CollaboratorError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(encode_data_uri(mime_for(path), &bytes))
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}
