// clicktally-config - Runtime configuration for the click telemetry pipeline
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path from CLICKTALLY_CONFIG env var
// 3. Config file contents from CLICKTALLY_CONFIG_CONTENT env var
// 4. Default config file locations (./clicktally.toml, ./.clicktally.toml)
// 5. Built-in defaults (lowest priority)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

mod env_overrides;
mod sources;
mod validation;

pub use env_overrides::{EnvSource, ENV_PREFIX};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// In-memory buffer limits and debounce window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub entry_size_estimate: usize,
    pub stale_flush_secs: u64,
    pub cooldown_ms: u64,
}

impl BufferConfig {
    pub fn stale_flush(&self) -> Duration {
        Duration::from_secs(self.stale_flush_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_bytes: 512 * 1024,
            entry_size_estimate: 256,
            stale_flush_secs: 300,
            cooldown_ms: 1_000,
        }
    }
}

/// Flush scheduling, chunking and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub flush_interval_secs: u64,
    pub chunk_max_entries: usize,
    pub chunk_max_bytes: usize,
    pub chunk_delay_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
    pub batch_window_secs: u64,
    pub breaker_key: String,
}

impl DispatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    /// Linear backoff: `retry_backoff_secs × attempt`.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.retry_backoff_secs.saturating_mul(u64::from(attempt)))
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_secs(self.batch_window_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 30,
            chunk_max_entries: 500,
            chunk_max_bytes: 1_000_000,
            chunk_delay_ms: 100,
            max_retries: 3,
            retry_backoff_secs: 10,
            batch_window_secs: 30,
            breaker_key: "click-batch".to_string(),
        }
    }
}

/// Circuit breaker thresholds for the batch endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
    pub cooldown_secs: u64,
}

impl BreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 8,
            success_threshold: 2,
            timeout_secs: 10,
            cooldown_secs: 300,
        }
    }
}

/// Batch-ingest endpoint and caller identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub url: String,
    /// Unload beacon target; falls back to `url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beacon_url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl EndpointConfig {
    pub fn beacon_url(&self) -> &str {
        self.beacon_url.as_deref().unwrap_or(&self.url)
    }
}

/// Durable snapshot storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: String,
    pub snapshot_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            path: "./.clicktally".to_string(),
            snapshot_key: "click_buffer.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StorageBackend::Fs),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            _ => anyhow::bail!("Unsupported storage backend: {}. Supported: fs, memory", s),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl RuntimeConfig {
    /// Load configuration from a specific file path (for CLI usage).
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        sources::load_from_file_path(path)
    }

    /// Load configuration with graceful fallback to defaults.
    /// Does not fail if config file is missing - uses defaults instead.
    pub fn load_or_default() -> Result<Self> {
        sources::load_or_default()
    }

    /// Merge another config into this one (used for TOML layering).
    pub fn merge(&mut self, other: RuntimeConfig) {
        self.buffer = other.buffer;
        self.dispatch = other.dispatch;
        self.breaker = other.breaker;
        self.storage = other.storage;
        self.logging = other.logging;

        if !other.endpoint.url.is_empty() {
            self.endpoint.url = other.endpoint.url;
        }
        if other.endpoint.beacon_url.is_some() {
            self.endpoint.beacon_url = other.endpoint.beacon_url;
        }
        if other.endpoint.user_id.is_some() {
            self.endpoint.user_id = other.endpoint.user_id;
        }
        self.endpoint.headers.extend(other.endpoint.headers);
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}
