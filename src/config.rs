use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Process-level configuration, sourced from the environment. The agent needs
/// *something* to construct its components from, so this loader is deliberately thin.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub upstream_proxy_header: Option<(String, String)>,
    pub camera_device: String,
    pub scratch_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub settings_cache_ttl: Duration,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("invalid upstream proxy header, expected \"Name: Value\": {0}")]
    InvalidProxyHeader(String),
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_url = required_var("SERVER_URL")?;
        let client_id = required_var("CLIENT_ID")?;
        let client_secret = required_var("CLIENT_SECRET")?;
        let camera_device = std::env::var("CAMERA_DEVICE").unwrap_or_else(|_| "0".to_string());

        let scratch_dir = std::env::var("SCRATCH_DIR")
            .unwrap_or_else(|_| "./temp".to_string())
            .into();
        let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string()).into();
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let settings_cache_ttl = match std::env::var("SETTINGS_CACHE_TTL_SECS") {
            Ok(raw) => {
                let secs: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "SETTINGS_CACHE_TTL_SECS",
                    value: raw.clone(),
                })?;
                Duration::from_secs(secs)
            }
            Err(_) => Duration::from_secs(300),
        };

        let upstream_proxy_header = match std::env::var("UPSTREAM_PROXY_HEADER") {
            Ok(raw) => Some(parse_header(&raw)?),
            Err(_) => None,
        };

        Ok(Self {
            server_url,
            client_id,
            client_secret,
            upstream_proxy_header,
            camera_device,
            scratch_dir,
            log_dir,
            log_level,
            settings_cache_ttl,
        })
    }

    /// Parses the configured camera device into an integer index, defaulting to 0
    /// for non-numeric values (e.g. `/dev/video0` style strings are not supported
    /// by the underlying capture backend, which is opened by index).
    pub fn camera_index(&self) -> i32 {
        self.camera_device
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .unwrap_or(0)
    }
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn parse_header(raw: &str) -> Result<(String, String), ConfigError> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| ConfigError::InvalidProxyHeader(raw.to_string()))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

/// Shared by tests in other modules that need a throwaway `AgentConfig`
/// without reading the environment.
#[cfg(test)]
pub(crate) fn test_config() -> AgentConfig {
    AgentConfig {
        server_url: "http://localhost".into(),
        client_id: "id".into(),
        client_secret: "secret".into(),
        upstream_proxy_header: None,
        camera_device: "0".into(),
        scratch_dir: "./temp".into(),
        log_dir: "./logs".into(),
        log_level: "info".into(),
        settings_cache_ttl: Duration::from_secs(300),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_index_parses_digits_from_device_string() {
        let mut cfg = test_config();
        cfg.camera_device = "/dev/video2".to_string();
        assert_eq!(cfg.camera_index(), 2);
    }

    #[test]
    fn camera_index_defaults_to_zero_for_non_numeric() {
        let mut cfg = test_config();
        cfg.camera_device = "front-door".to_string();
        assert_eq!(cfg.camera_index(), 0);
    }

    #[test]
    fn parse_header_splits_on_first_colon() {
        let (name, value) = parse_header("X-Proxy-Auth: secret:withcolon").unwrap();
        assert_eq!(name, "X-Proxy-Auth");
        assert_eq!(value, "secret:withcolon");
    }

    #[test]
    fn parse_header_rejects_missing_colon() {
        assert!(parse_header("no-colon-here").is_err());
    }
}
