//! Configuration structures and loading logic

use crate::remote::RetryPolicy;
use crate::storage::StorageBackend;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory under the home directory holding the config file
pub const CONFIG_DIR_NAME: &str = ".civitai-sync";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Main sync configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,

    /// Optional bearer token; requests are unauthenticated without it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Minimum spacing between the start of two requests
    pub rate_limit_delay_secs: f64,
    pub max_retries: u32,
    pub backoff_base_secs: f64,
    pub backoff_max_secs: f64,
    pub request_timeout_secs: u64,
    pub max_metadata_age_days: u32,
    pub hash_workers: usize,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            api_key: None,
            rate_limit_delay_secs: default_rate_limit_delay(),
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            request_timeout_secs: default_request_timeout(),
            max_metadata_age_days: default_max_metadata_age_days(),
            hash_workers: 1,
            user_agent: default_user_agent(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from file with environment variable overrides
    ///
    /// Without an explicit path the default config file is used when it
    /// exists.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(|| default_config_path().filter(|p| p.is_file()));

        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            tracing::debug!(config = %path.display(), "Loaded config file");
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(key) = std::env::var("CIVITAI_API_KEY")
            && !key.trim().is_empty()
        {
            self.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("CIVITAI_SYNC_BASE_URL") {
            self.api_base_url = url;
        }
        if let Ok(delay) = std::env::var("CIVITAI_SYNC_RATE_LIMIT") {
            self.rate_limit_delay_secs = delay
                .parse()
                .context("Invalid CIVITAI_SYNC_RATE_LIMIT value")?;
        }
        if let Ok(days) = std::env::var("CIVITAI_SYNC_MAX_AGE_DAYS") {
            self.max_metadata_age_days = days
                .parse()
                .context("Invalid CIVITAI_SYNC_MAX_AGE_DAYS value")?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("rate_limit_delay_secs", self.rate_limit_delay_secs),
            ("backoff_base_secs", self.backoff_base_secs),
            ("backoff_max_secs", self.backoff_max_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                anyhow::bail!("{} must be a non-negative number (got {})", name, value);
            }
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            anyhow::bail!(
                "backoff_max_secs ({}) must be >= backoff_base_secs ({})",
                self.backoff_max_secs,
                self.backoff_base_secs
            );
        }
        if self.hash_workers == 0 {
            anyhow::bail!("hash_workers must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be at least 1");
        }

        let url = reqwest::Url::parse(&self.api_base_url)
            .with_context(|| format!("Invalid api_base_url: {}", self.api_base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("api_base_url must use http or https (got {})", url.scheme());
        }

        Ok(())
    }

    /// The API key, if one is set and not blank
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.rate_limit_delay_secs)
            .unwrap_or(Duration::from_secs_f64(default_rate_limit_delay()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.max_retries,
            base: Duration::try_from_secs_f64(self.backoff_base_secs).unwrap_or(defaults.base),
            max: Duration::try_from_secs_f64(self.backoff_max_secs).unwrap_or(defaults.max),
        }
    }
}

/// `~/.civitai-sync/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

// ============================================================================
// Credential Store
// ============================================================================

async fn load_table(storage: &dyn StorageBackend, path: &Path) -> Result<toml::Table> {
    match storage.load(path).await? {
        Some(content) => toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {:?}", path)),
        None => Ok(toml::Table::new()),
    }
}

/// Store `api_key` in the config file at `path`, keeping every other entry
pub async fn save_api_key(storage: &dyn StorageBackend, path: &Path, api_key: &str) -> Result<()> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        anyhow::bail!("API key cannot be empty");
    }

    let mut table = load_table(storage, path).await?;
    table.insert(
        "api_key".to_string(),
        toml::Value::String(api_key.to_string()),
    );
    let content = toml::to_string_pretty(&table).context("Failed to serialize config")?;
    storage.save(path, &content).await?;

    tracing::info!(config = %path.display(), "API key saved");
    Ok(())
}

/// Remove the stored API key; returns whether one was present
pub async fn remove_api_key(storage: &dyn StorageBackend, path: &Path) -> Result<bool> {
    if storage.load(path).await?.is_none() {
        return Ok(false);
    }
    let mut table = load_table(storage, path).await?;
    if table.remove("api_key").is_none() {
        return Ok(false);
    }
    let content = toml::to_string_pretty(&table).context("Failed to serialize config")?;
    storage.save(path, &content).await?;

    tracing::info!(config = %path.display(), "API key removed");
    Ok(true)
}

// Default functions
fn default_api_base_url() -> String {
    "https://civitai.com/api/v1".to_string()
}
fn default_rate_limit_delay() -> f64 {
    1.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base() -> f64 {
    1.0
}
fn default_backoff_max() -> f64 {
    60.0
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_metadata_age_days() -> u32 {
    30
}
fn default_user_agent() -> String {
    format!("civitai-sync/{}", env!("CARGO_PKG_VERSION"))
}
