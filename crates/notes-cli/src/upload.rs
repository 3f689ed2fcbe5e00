//! Client for the blob upload endpoint.
//!
//! Attachments are POSTed to `{base}/upload/{note_id}/{filename}`. The server
//! answers with a retrieval URL, either as a JSON `url` field, as a body that
//! is itself an absolute URL or path (bare or as a JSON string), or in the
//! `Location` header (tried in that order).

use reqwest::{StatusCode, Url};
use reqwest::header::LOCATION;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upload rejected with status {0}")]
    Status(StatusCode),

    #[error("upload response carried no retrieval URL")]
    MissingUrl,
}

pub type Result<T> = std::result::Result<T, UploadError>;

pub struct UploadClient {
    client: reqwest::Client,
    base_url: String,
}

impl UploadClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Endpoint for one attachment of one note.
    pub fn endpoint(&self, note_id: &str, filename: &str) -> String {
        format!(
            "{}/upload/{}/{}",
            self.base_url,
            urlencoding::encode(note_id),
            urlencoding::encode(filename)
        )
    }

    /// Upload `bytes` and return the URL the blob can be fetched from.
    pub async fn upload(&self, note_id: &str, filename: &str, bytes: Vec<u8>) -> Result<String> {
        let url = self.endpoint(note_id, filename);
        debug!("Uploading {} bytes to {}", bytes.len(), url);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        let retrieval = retrieval_url(status, location.as_deref(), &body)?;
        info!("Uploaded {} for {}", filename, note_id);
        Ok(retrieval)
    }
}

/// Pick the retrieval URL out of an upload response.
pub fn retrieval_url(status: StatusCode, location: Option<&str>, body: &str) -> Result<String> {
    if !status.is_success() {
        return Err(UploadError::Status(status));
    }

    let body = body.trim();
    let from_body = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::String(text)) => as_retrieval_url(&text),
        Ok(json) => json.get("url").and_then(|u| u.as_str()).map(str::to_string),
        Err(_) => as_retrieval_url(body),
    };
    if let Some(url) = from_body {
        return Ok(url);
    }

    location
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .ok_or(UploadError::MissingUrl)
}

/// Accept an absolute http(s) URL or an absolute path, nothing else.
fn as_retrieval_url(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() || text.contains(char::is_whitespace) {
        return None;
    }
    if text.starts_with('/') && !text.starts_with("//") {
        return Some(text.to_string());
    }
    let url = Url::parse(text).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| text.to_string())
}
