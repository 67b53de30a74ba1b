use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GmailError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
}

/// Per-account sliding-window quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Quota units allowed per account inside one window
    #[serde(default = "default_quota_budget")]
    pub budget: i64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Upper bound on a single wait before the window is re-checked
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            budget: default_quota_budget(),
            window_secs: default_window_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of random jitter added to each delay (0 disables jitter)
    #[serde(default)]
    pub jitter_ms: u64,
    /// Give up before sleeping if the call would run past this many seconds
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: 0,
            deadline_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Maximum entries held by the in-memory backend
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_list_ttl_secs")]
    pub list_ttl_secs: u64,
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    #[serde(default = "default_message_ttl_secs")]
    pub metadata_ttl_secs: u64,
    #[serde(default = "default_label_ttl_secs")]
    pub label_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: default_cache_backend(),
            dir: default_cache_dir(),
            capacity: default_cache_capacity(),
            list_ttl_secs: default_list_ttl_secs(),
            message_ttl_secs: default_message_ttl_secs(),
            metadata_ttl_secs: default_message_ttl_secs(),
            label_ttl_secs: default_label_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Items in flight at once per batch
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,
    /// Default cap for query-resolved batches (mark-all-read, archive-all)
    #[serde(default = "default_batch_max_messages")]
    pub max_messages: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_batch_concurrency(),
            max_messages: default_batch_max_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    /// Directory holding one `<account>.json` token file per account
    #[serde(default = "default_accounts_dir")]
    pub accounts_dir: PathBuf,
    #[serde(default = "default_credentials_path")]
    pub credentials: PathBuf,
    /// Per-request timeout for the HTTP transport
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            accounts_dir: default_accounts_dir(),
            credentials: default_credentials_path(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_quota_budget() -> i64 {
    250
}

fn default_window_secs() -> u64 {
    1
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    32_000
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::File
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache/gmail")
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_list_ttl_secs() -> u64 {
    300
}

fn default_message_ttl_secs() -> u64 {
    3600
}

fn default_label_ttl_secs() -> u64 {
    3600
}

fn default_batch_concurrency() -> usize {
    10
}

fn default_batch_max_messages() -> usize {
    500
}

fn default_accounts_dir() -> PathBuf {
    PathBuf::from("accounts")
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("accounts/credentials.json")
}

fn default_timeout_secs() -> u64 {
    30
}

/// Only a case-insensitive `true` enables a flag
fn env_flag(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn config_err(action: &str, path: &Path, err: impl std::fmt::Display) -> GmailError {
    GmailError::ConfigError(format!("Failed to {} {}: {}", action, path.display(), err))
}

impl Config {
    /// Read and validate `path`; a missing file yields the defaults
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::warn!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| config_err("read", path, e))?;
        let config: Self = toml::from_str(&raw).map_err(|e| config_err("parse", path, e))?;
        config.validate()?;

        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| config_err("create directory for", path, e))?;
        }
        let rendered = toml::to_string_pretty(self).map_err(|e| config_err("serialize", path, e))?;
        tokio::fs::write(path, rendered)
            .await
            .map_err(|e| config_err("write", path, e))?;

        tracing::info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Apply `GMAIL_*` environment overrides on top of the file values
    ///
    /// - `GMAIL_ENABLE_CACHE`: `true`/`false`
    /// - `GMAIL_ENABLE_QUOTA`: `true`/`false`
    /// - `GMAIL_CACHE_DIR`: cache directory for the file backend
    /// - `GMAIL_TIMEOUT`: request timeout in seconds
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("GMAIL_ENABLE_CACHE") {
            self.cache.enabled = env_flag(&value);
        }
        if let Ok(value) = std::env::var("GMAIL_ENABLE_QUOTA") {
            self.quota.enabled = env_flag(&value);
        }
        if let Ok(dir) = std::env::var("GMAIL_CACHE_DIR") {
            if !dir.is_empty() {
                self.cache.dir = PathBuf::from(dir);
            }
        }
        if let Ok(timeout) = std::env::var("GMAIL_TIMEOUT") {
            self.gmail.timeout_secs = timeout.trim().parse().map_err(|_| {
                GmailError::ConfigError(format!("GMAIL_TIMEOUT must be a number, got '{}'", timeout))
            })?;
        }
        self.validate()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.quota.budget <= 0 {
            return Err(GmailError::ConfigError(
                "quota.budget must be greater than 0".to_string(),
            ));
        }
        if self.quota.window_secs == 0 {
            return Err(GmailError::ConfigError(
                "quota.window_secs must be at least 1".to_string(),
            ));
        }
        if self.quota.poll_interval_ms == 0 {
            return Err(GmailError::ConfigError(
                "quota.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.retry.multiplier < 1.0 {
            return Err(GmailError::ConfigError(
                "retry.multiplier must be at least 1.0 so delays never shrink".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(GmailError::ConfigError(
                "retry.max_delay_ms cannot be smaller than retry.base_delay_ms".to_string(),
            ));
        }

        if self.cache.capacity == 0 {
            return Err(GmailError::ConfigError(
                "cache.capacity must be greater than 0".to_string(),
            ));
        }
        #[cfg(not(feature = "cache"))]
        if self.cache.enabled && self.cache.backend == CacheBackend::Sqlite {
            return Err(GmailError::ConfigError(
                "cache.backend = \"sqlite\" requires the `cache` feature".to_string(),
            ));
        }

        if self.batch.concurrency == 0 {
            return Err(GmailError::ConfigError(
                "batch.concurrency must be at least 1".to_string(),
            ));
        }
        if self.batch.concurrency > 50 {
            return Err(GmailError::ConfigError(
                "batch.concurrency cannot exceed 50 (to stay under Gmail API rate limits)".to_string(),
            ));
        }
        if self.batch.max_messages == 0 {
            return Err(GmailError::ConfigError(
                "batch.max_messages must be greater than 0".to_string(),
            ));
        }

        if self.gmail.timeout_secs == 0 {
            return Err(GmailError::ConfigError(
                "gmail.timeout_secs must be greater than 0".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        Self::default().save(path).await
    }
}
