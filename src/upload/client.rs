use std::time::Duration;

use reqwest::Client;

use super::{UploadError, UploadJob};
use crate::config::AgentConfig;

/// Per-attempt deadline for a single upload POST.
const UPLOAD_DEADLINE: Duration = Duration::from_secs(60);

/// HTTP client for the upload control-plane endpoint. One pooled
/// `reqwest::Client` shared across every attempt, first-try or retry.
pub struct UploadClient {
    http: Client,
    upload_url: String,
    client_id: String,
    client_secret: String,
    proxy_header: Option<(String, String)>,
}

impl UploadClient {
    pub fn new(config: &AgentConfig) -> Result<Self, UploadError> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            upload_url: format!("{}/api/clips", config.server_url.trim_end_matches('/')),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            proxy_header: config.upstream_proxy_header.clone(),
        })
    }

    pub async fn upload(&self, job: &UploadJob) -> Result<(), UploadError> {
        let bytes = tokio::fs::read(&job.path).await.map_err(UploadError::ReadFailed)?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name("clip.mp4")
            .mime_str(mime_for_format(&job.format))?;

        let form = reqwest::multipart::Form::new()
            .text("timestamp", job.recorded_at.to_rfc3339())
            .text("duration", format!("{:.1}", job.duration.as_secs_f64()))
            .text("has_motion", if job.has_motion { "true" } else { "false" })
            .part("video", part);

        let response = tokio::time::timeout(UPLOAD_DEADLINE, self.send(form))
            .await
            .map_err(|_| UploadError::Timeout)??;

        match response.status().as_u16() {
            200 | 201 => Ok(()),
            _ => Err(UploadError::Rejected(response.status())),
        }
    }

    async fn send(&self, form: reqwest::multipart::Form) -> Result<reqwest::Response, UploadError> {
        let mut request = self
            .http
            .post(&self.upload_url)
            .multipart(form)
            .basic_auth(&self.client_id, Some(&self.client_secret));

        if let Some((name, value)) = &self.proxy_header {
            request = request.header(name.as_str(), value.as_str());
        }

        Ok(request.send().await?)
    }
}

/// The upload filename is always `clip.mp4` regardless of container, so this
/// MIME type is what actually tells the server what it received.
fn mime_for_format(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "video/mp4",
    }
}
