use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ledger::PersistPolicy;
use crate::waiter::WaiterSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_provider() -> String {
    "gemini".to_string()
}
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_api_key_env() -> String {
    "GOOGLE_API_KEY".to_string()
}
fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./data.json")
}
fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("filesearch-uploads")
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_files")]
    pub max_files_per_request: usize,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub operation_poll_interval_ms: u64,
    #[serde(default = "default_transient_poll_failures")]
    pub transient_poll_failures: u32,
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,
    #[serde(default = "default_persist_backoff_ms")]
    pub persist_backoff_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_files_per_request: default_max_files(),
            max_file_size: default_max_file_size(),
            operation_timeout_secs: default_operation_timeout_secs(),
            operation_poll_interval_ms: default_poll_interval_ms(),
            transient_poll_failures: default_transient_poll_failures(),
            persist_attempts: default_persist_attempts(),
            persist_backoff_ms: default_persist_backoff_ms(),
        }
    }
}

fn default_max_files() -> usize {
    10
}
fn default_max_file_size() -> usize {
    100 * 1024 * 1024
}
fn default_operation_timeout_secs() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_transient_poll_failures() -> u32 {
    2
}
fn default_persist_attempts() -> u32 {
    3
}
fn default_persist_backoff_ms() -> u64 {
    100
}

impl UploadConfig {
    pub fn waiter_settings(&self) -> WaiterSettings {
        WaiterSettings {
            poll_interval: Duration::from_millis(self.operation_poll_interval_ms),
            timeout: Duration::from_secs(self.operation_timeout_secs),
            transient_failures: self.transient_poll_failures,
        }
    }

    pub fn persist_policy(&self) -> PersistPolicy {
        PersistPolicy {
            attempts: self.persist_attempts,
            backoff: Duration::from_millis(self.persist_backoff_ms),
        }
    }

    /// Largest request body the upload route accepts.
    pub fn body_limit(&self) -> usize {
        self.max_file_size
            .saturating_mul(self.max_files_per_request)
            .saturating_add(1024 * 1024)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SweepConfig {
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_max_age_secs() -> u64 {
    3600
}
fn default_interval_secs() -> u64 {
    1800
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_max_requests() -> u32 {
    100
}
fn default_window_secs() -> u64 {
    60
}

impl Config {
    /// Config with defaults everywhere except the bind address.
    pub fn with_bind(bind: impl Into<String>) -> Self {
        Self {
            server: ServerConfig { bind: bind.into() },
            remote: RemoteConfig::default(),
            storage: StorageConfig::default(),
            upload: UploadConfig::default(),
            sweep: SweepConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // The API key is read when the gemini client is built.
    match config.remote.provider.as_str() {
        "gemini" | "memory" => {}
        other => bail!("Unknown remote provider: '{}'. Must be gemini or memory.", other),
    }
    if config.remote.api_key_env.trim().is_empty() {
        bail!("remote.api_key_env must not be empty");
    }

    if config.remote.default_model.trim().is_empty() {
        bail!("remote.default_model must not be empty");
    }

    let upload = &config.upload;
    if upload.max_files_per_request == 0 {
        bail!("upload.max_files_per_request must be > 0");
    }
    if upload.max_file_size == 0 {
        bail!("upload.max_file_size must be > 0");
    }
    if upload.operation_poll_interval_ms == 0 {
        bail!("upload.operation_poll_interval_ms must be > 0");
    }
    if upload.operation_poll_interval_ms >= upload.operation_timeout_secs.saturating_mul(1000) {
        bail!("upload.operation_poll_interval_ms must be shorter than operation_timeout_secs");
    }
    if upload.persist_attempts == 0 {
        bail!("upload.persist_attempts must be >= 1");
    }

    if config.sweep.interval_secs == 0 || config.sweep.max_age_secs == 0 {
        bail!("sweep.interval_secs and sweep.max_age_secs must be > 0");
    }
    if config.rate_limit.max_requests == 0 || config.rate_limit.window_secs == 0 {
        bail!("rate_limit.max_requests and rate_limit.window_secs must be > 0");
    }

    Ok(())
}
