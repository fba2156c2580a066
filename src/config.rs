//! Runtime configuration: Baidu OCR credentials and endpoints, read from the
//! environment after `.env` files are loaded.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TOKEN_URL: &str = "https://aip.baidubce.com/oauth/2.0/token";
pub const DEFAULT_VAT_URL: &str = "https://aip.baidubce.com/rest/2.0/ocr/v1/vat_invoice";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub const ENV_API_KEY: &str = "BAIDU_OCR_API_KEY";
pub const ENV_SECRET_KEY: &str = "BAIDU_OCR_SECRET_KEY";
pub const ENV_TOKEN_URL: &str = "BAIDU_OCR_TOKEN_URL";
pub const ENV_VAT_URL: &str = "BAIDU_OCR_VAT_URL";
pub const ENV_TIMEOUT_SECS: &str = "BAIDU_OCR_TIMEOUT_SECS";

const APP_DIR_NAME: &str = "vat-invoice-extract";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set (add it to .env or the environment)")]
    Missing(&'static str),
    #[error("{name} is not a valid number of seconds: {value:?}")]
    InvalidTimeout { name: &'static str, value: String },
}

/// Credentials and endpoints for the Baidu VAT invoice API.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub secret_key: String,
    pub token_url: String,
    pub vat_url: String,
    pub timeout: Duration,
}

impl AppConfig {
    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            vat_url: DEFAULT_VAT_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Build from the process environment. Call [`load_env`] first so `.env`
    /// files are visible.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let api_key = get(ENV_API_KEY).ok_or(ConfigError::Missing(ENV_API_KEY))?;
        let secret_key = get(ENV_SECRET_KEY).ok_or(ConfigError::Missing(ENV_SECRET_KEY))?;
        let mut config = Self::new(api_key, secret_key);
        if let Some(url) = get(ENV_TOKEN_URL) {
            config.token_url = url;
        }
        if let Some(url) = get(ENV_VAT_URL) {
            config.vat_url = url;
        }
        if let Some(raw) = get(ENV_TIMEOUT_SECS) {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::InvalidTimeout {
                name: ENV_TIMEOUT_SECS,
                value: raw.clone(),
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Per-user config directory holding an optional `.env`.
pub fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR_NAME))
}

/// Load `.env` from the working directory, then from the per-user config
/// directory. Variables already set are never overridden.
pub fn load_env() {
    let _ = dotenvy::dotenv();
    if let Some(dir) = user_config_dir() {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }
    }
}

/// "configured" / "not_configured", as reported by the `status` command.
pub fn credentials_status() -> &'static str {
    match (std::env::var(ENV_API_KEY), std::env::var(ENV_SECRET_KEY)) {
        (Ok(k), Ok(s)) if !k.trim().is_empty() && !s.trim().is_empty() => "configured",
        _ => "not_configured",
    }
}
