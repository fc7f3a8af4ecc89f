//! Streaming download of collaborator outputs

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::DownloadError;

/// Download `url` to `dest`, returning the number of bytes written
///
/// The body is streamed to `<dest>.tmp` and renamed into place once complete,
/// so `dest` never holds a partial file. `data:` URIs are decoded directly.
pub async fn download_to(client: &reqwest::Client, url: &str, dest: &Path) -> Result<u64, DownloadError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path_for(dest);

    let written = if url.starts_with("data:") {
        let bytes = decode_data_uri(url)?;
        fs::write(&temp_path, &bytes).await?;
        bytes.len() as u64
    } else {
        debug!("Downloading {} to {}", url, dest.display());

        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let mut file = fs::File::create(&temp_path).await?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| DownloadError::DownloadFailed(e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }

        file.flush().await?;
        drop(file);
        downloaded
    };

    fs::rename(&temp_path, dest).await?;

    info!("Saved {} bytes to {}", written, dest.display());
    Ok(written)
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    dest.with_file_name(name)
}

/// Decode a base64 `data:` URI
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>, DownloadError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| DownloadError::InvalidDataUri("missing data: prefix".to_string()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| DownloadError::InvalidDataUri("missing payload separator".to_string()))?;

    if !meta.ends_with(";base64") {
        return Err(DownloadError::InvalidDataUri(format!(
            "only base64 payloads are supported, got '{}'",
            meta
        )));
    }

    STANDARD
        .decode(payload)
        .map_err(|e| DownloadError::InvalidDataUri(e.to_string()))
}

/// Encode bytes as a base64 `data:` URI
pub fn encode_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}
