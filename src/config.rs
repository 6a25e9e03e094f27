use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid environment variable format for {0}: {1}")]
    InvalidVar(String, String),
    #[error(transparent)]
    DotEnvError(#[from] dotenvy::Error),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Apps Script web app answering JSONP reads.
    pub api_base_url: reqwest::Url,
    /// CORS-adding proxy in front of the Apps Script write actions.
    pub proxy_url: reqwest::Url,
    /// Directory for the persisted cache; in-memory cache when unset.
    pub cache_dir: Option<PathBuf>,
    pub countdown_secs: u32,
    pub gate_session_ttl: Duration,
    pub thumbnail_size: String,
    pub admin_token: Option<String>,
    pub max_upload_bytes: usize,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        // A missing .env is fine; a malformed one is not.
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!(".env file loaded from path: {}", path.display()),
            Err(e) if e.not_found() => tracing::info!(".env file not found, relying on environment variables"),
            Err(e) => return Err(e.into()),
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_address = parse_or(&lookup, "BIND_ADDRESS", "0.0.0.0:3000")?;

        let api_base_url = required_url(&lookup, "IMAGE_HUB_API_BASE_URL")?;
        let proxy_url = required_url(&lookup, "IMAGE_HUB_PROXY_URL")?;

        let cache_dir = lookup("IMAGE_HUB_CACHE_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let countdown_secs = parse_or(&lookup, "DOWNLOAD_COUNTDOWN_SECS", "8")?;
        let gate_session_ttl = Duration::from_secs(parse_or(&lookup, "GATE_SESSION_TTL_SECS", "1800")?);
        let thumbnail_size = lookup("THUMBNAIL_SIZE").unwrap_or_else(|| "s400".to_string());
        let admin_token = lookup("ADMIN_TOKEN").filter(|v| !v.is_empty());
        let max_upload_bytes = parse_or(&lookup, "MAX_UPLOAD_BYTES", "10485760")?;

        Ok(Config {
            bind_address,
            api_base_url,
            proxy_url,
            cache_dir,
            countdown_secs,
            gate_session_ttl,
            thumbnail_size,
            admin_token,
            max_upload_bytes,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key).unwrap_or_else(|| {
        tracing::debug!("{key} not set, using default: {default}");
        default.to_string()
    });
    raw.parse()
        .map_err(|e: T::Err| ConfigError::InvalidVar(key.into(), e.to_string()))
}

fn required_url(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<reqwest::Url, ConfigError> {
    let raw = lookup(key).ok_or_else(|| ConfigError::MissingVar(key.into()))?;
    reqwest::Url::parse(&raw).map_err(|e| ConfigError::InvalidVar(key.into(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_optional_vars_are_missing() {
        let config = Config::from_lookup(lookup_from(&[
            ("IMAGE_HUB_API_BASE_URL", "https://script.google.com/macros/s/abc/exec"),
            ("IMAGE_HUB_PROXY_URL", "https://proxy.example.com/functions/v1/google-apps-proxy"),
        ]))
        .unwrap();

        assert_eq!(config.bind_address.port(), 3000);
        assert_eq!(config.countdown_secs, 8);
        assert_eq!(config.gate_session_ttl, Duration::from_secs(1800));
        assert_eq!(config.thumbnail_size, "s400");
        assert!(config.cache_dir.is_none());
        assert!(config.admin_token.is_none());
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn missing_base_url_is_reported() {
        let err = Config::from_lookup(lookup_from(&[("IMAGE_HUB_PROXY_URL", "https://proxy.example.com")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref key) if key == "IMAGE_HUB_API_BASE_URL"));
    }

    #[test]
    fn malformed_countdown_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("IMAGE_HUB_API_BASE_URL", "https://script.example.com/exec"),
            ("IMAGE_HUB_PROXY_URL", "https://proxy.example.com"),
            ("DOWNLOAD_COUNTDOWN_SECS", "-3"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar(ref key, _) if key == "DOWNLOAD_COUNTDOWN_SECS"));
    }
}
