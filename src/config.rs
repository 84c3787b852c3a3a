use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::extract::{ExtractLimits, MAX_FILE_BYTES, MAX_TEXT_CHARS};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub object_store: ObjectStoreConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Upper bound for a multipart request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_max_body_bytes() -> usize {
    128 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (MinIO). Requests use path-style addressing when set.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_presign_ttl")]
    pub presign_ttl_secs: u64,
}

impl ObjectStoreConfig {
    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_presign_ttl() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    /// API root of the RAG platform, e.g. `http://dify.local/v1`.
    pub base_url: String,
    pub dataset_id: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_dataset_key_env")]
    pub dataset_key_env: String,
    #[serde(default = "default_app_key_env")]
    pub app_key_env: String,
}

impl RemoteConfig {
    /// Reads the dataset and chat API keys from the configured env vars.
    pub fn api_keys(&self) -> Result<(String, String)> {
        let dataset = std::env::var(&self.dataset_key_env)
            .with_context(|| format!("{} environment variable not set", self.dataset_key_env))?;
        let app = std::env::var(&self.app_key_env)
            .with_context(|| format!("{} environment variable not set", self.app_key_env))?;
        Ok((dataset, app))
    }
}

fn default_user() -> String {
    "gateway".to_string()
}
fn default_remote_timeout() -> u64 {
    60
}
fn default_dataset_key_env() -> String {
    "RAG_DATASET_API_KEY".to_string()
}
fn default_app_key_env() -> String {
    "RAG_APP_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_relay_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_flush_chars")]
    pub flush_chars: usize,
    #[serde(default = "default_fallback_references")]
    pub fallback_references: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_empty_answer")]
    pub empty_answer: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_relay_timeout(),
            flush_chars: default_flush_chars(),
            fallback_references: default_fallback_references(),
            channel_capacity: default_channel_capacity(),
            empty_answer: default_empty_answer(),
        }
    }
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_relay_timeout() -> u64 {
    30
}
fn default_flush_chars() -> usize {
    10
}
fn default_fallback_references() -> usize {
    2
}
fn default_channel_capacity() -> usize {
    64
}
fn default_empty_answer() -> String {
    "No relevant information was found.".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            max_chars: default_max_chars(),
        }
    }
}

impl ExtractConfig {
    pub fn limits(&self) -> ExtractLimits {
        ExtractLimits {
            max_file_bytes: self.max_file_bytes,
            max_chars: self.max_chars,
        }
    }
}

fn default_max_file_bytes() -> u64 {
    MAX_FILE_BYTES
}
fn default_max_chars() -> usize {
    MAX_TEXT_CHARS
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.object_store.bucket.trim().is_empty() {
        anyhow::bail!("object_store.bucket must not be empty");
    }
    if config.object_store.presign_ttl_secs == 0 || config.object_store.presign_ttl_secs > 604_800
    {
        anyhow::bail!("object_store.presign_ttl_secs must be in [1, 604800]");
    }
    if let Some(endpoint) = &config.object_store.endpoint_url {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            anyhow::bail!("object_store.endpoint_url must start with http:// or https://");
        }
    }

    if !config.remote.base_url.starts_with("http://")
        && !config.remote.base_url.starts_with("https://")
    {
        anyhow::bail!("remote.base_url must start with http:// or https://");
    }
    if config.remote.dataset_id.trim().is_empty() {
        anyhow::bail!("remote.dataset_id must not be empty");
    }

    if config.relay.timeout_secs == 0 {
        anyhow::bail!("relay.timeout_secs must be > 0");
    }
    if config.relay.flush_chars == 0 {
        anyhow::bail!("relay.flush_chars must be > 0");
    }
    if config.relay.channel_capacity == 0 {
        anyhow::bail!("relay.channel_capacity must be > 0");
    }

    if config.extract.max_file_bytes == 0 || config.extract.max_chars == 0 {
        anyhow::bail!("extract.max_file_bytes and extract.max_chars must be > 0");
    }

    Ok(config)
}
