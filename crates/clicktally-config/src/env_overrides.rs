use super::{LogFormat, RuntimeConfig, StorageBackend};
use anyhow::{anyhow, Context, Result};
use std::str::FromStr;

pub const ENV_PREFIX: &str = "CLICKTALLY_";

/// Abstraction over environment-variable lookups so embedders without
/// `std::env` (or tests) can supply their own source of overrides.
pub trait EnvSource {
    /// Look up `key` with the CLICKTALLY_ prefix applied.
    fn get(&self, key: &str) -> Option<String>;
}

/// Apply environment-variable overrides (highest priority) to the runtime config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    // Buffer
    if let Some(val) = get_env_parsed(env, "BUFFER_MAX_ENTRIES")? {
        config.buffer.max_entries = val;
    }
    if let Some(val) = get_env_parsed(env, "BUFFER_MAX_BYTES")? {
        config.buffer.max_bytes = val;
    }
    if let Some(val) = get_env_parsed(env, "BUFFER_STALE_FLUSH_SECS")? {
        config.buffer.stale_flush_secs = val;
    }
    if let Some(val) = get_env_parsed(env, "BUFFER_COOLDOWN_MS")? {
        config.buffer.cooldown_ms = val;
    }

    // Dispatch
    if let Some(val) = get_env_parsed(env, "DISPATCH_FLUSH_INTERVAL_SECS")? {
        config.dispatch.flush_interval_secs = val;
    }
    if let Some(val) = get_env_parsed(env, "DISPATCH_CHUNK_MAX_ENTRIES")? {
        config.dispatch.chunk_max_entries = val;
    }
    if let Some(val) = get_env_parsed(env, "DISPATCH_CHUNK_MAX_BYTES")? {
        config.dispatch.chunk_max_bytes = val;
    }
    if let Some(val) = get_env_parsed(env, "DISPATCH_MAX_RETRIES")? {
        config.dispatch.max_retries = val;
    }
    if let Some(val) = get_env_parsed(env, "DISPATCH_RETRY_BACKOFF_SECS")? {
        config.dispatch.retry_backoff_secs = val;
    }

    // Circuit breaker
    if let Some(val) = get_env_parsed(env, "BREAKER_FAILURE_THRESHOLD")? {
        config.breaker.failure_threshold = val;
    }
    if let Some(val) = get_env_parsed(env, "BREAKER_SUCCESS_THRESHOLD")? {
        config.breaker.success_threshold = val;
    }
    if let Some(val) = get_env_parsed(env, "BREAKER_TIMEOUT_SECS")? {
        config.breaker.timeout_secs = val;
    }
    if let Some(val) = get_env_parsed(env, "BREAKER_COOLDOWN_SECS")? {
        config.breaker.cooldown_secs = val;
    }

    // Endpoint
    if let Some(url) = env.get("ENDPOINT_URL") {
        config.endpoint.url = url;
    }
    if let Some(url) = env.get("BEACON_URL") {
        config.endpoint.beacon_url = Some(url);
    }
    if let Some(user_id) = env.get("USER_ID") {
        config.endpoint.user_id = Some(user_id).filter(|u| !u.is_empty());
    }
    if let Some(token) = env.get("ENDPOINT_TOKEN") {
        config
            .endpoint
            .headers
            .insert("Authorization".to_string(), format!("Bearer {}", token));
    }

    // Storage
    if let Some(backend) = env.get("STORAGE_BACKEND") {
        config.storage.backend = backend
            .parse::<StorageBackend>()
            .context("Invalid CLICKTALLY_STORAGE_BACKEND value")?;
    }
    if let Some(path) = env.get("STORAGE_PATH") {
        config.storage.path = path;
    }

    // Logging
    if let Some(level) = env.get("LOG_LEVEL") {
        config.logging.log_level = level;
    }
    if let Some(format) = env.get("LOG_FORMAT") {
        config.logging.log_format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }

    Ok(())
}

fn get_env_parsed<E, T>(env: &E, key: &str) -> Result<Option<T>>
where
    E: EnvSource,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env.get(key) {
        Some(val) => {
            let parsed = val
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}
