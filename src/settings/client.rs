use std::time::Duration;

use reqwest::Client;

use super::SettingsError;
use crate::config::AgentConfig;
use crate::policy::PolicySnapshot;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin wrapper around a single pooled `reqwest::Client`, built once and reused for
/// every initial fetch and background refresh.
pub struct SettingsClient {
    http: Client,
    settings_url: String,
    client_id: String,
    client_secret: String,
    proxy_header: Option<(String, String)>,
}

impl SettingsClient {
    pub fn new(config: &AgentConfig) -> Result<Self, SettingsError> {
        let http = Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            http,
            settings_url: format!("{}/api/client/settings", config.server_url.trim_end_matches('/')),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            proxy_header: config.upstream_proxy_header.clone(),
        })
    }

    pub async fn fetch_settings(&self) -> Result<PolicySnapshot, SettingsError> {
        let mut request = self
            .http
            .get(&self.settings_url)
            .basic_auth(&self.client_id, Some(&self.client_secret));

        if let Some((name, value)) = &self.proxy_header {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(SettingsError::UnexpectedStatus(response.status()));
        }

        let body = response.bytes().await?;
        let snapshot = serde_json::from_slice(&body)?;
        Ok(snapshot)
    }
}
