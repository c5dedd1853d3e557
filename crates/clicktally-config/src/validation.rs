// Configuration validation
//
// Validates that required fields are present and values are sensible

use super::*;
use anyhow::{bail, Result};
use tracing::warn;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_buffer_config(&config.buffer)?;
    validate_dispatch_config(&config.dispatch)?;
    validate_breaker_config(&config.breaker)?;
    validate_endpoint_config(&config.endpoint)?;
    validate_storage_config(&config.storage)?;
    Ok(())
}

fn validate_buffer_config(config: &BufferConfig) -> Result<()> {
    if config.max_entries == 0 {
        bail!("buffer.max_entries must be greater than 0");
    }

    if config.max_bytes == 0 {
        bail!("buffer.max_bytes must be greater than 0");
    }

    if config.stale_flush_secs == 0 {
        bail!("buffer.stale_flush_secs must be greater than 0");
    }

    if config.max_entries > 100_000 {
        warn!(
            max_entries = config.max_entries,
            "buffer.max_entries is very large; flushes may exceed endpoint limits"
        );
    }

    Ok(())
}

fn validate_dispatch_config(config: &DispatchConfig) -> Result<()> {
    if config.flush_interval_secs == 0 {
        bail!("dispatch.flush_interval_secs must be greater than 0");
    }

    if config.chunk_max_entries == 0 {
        bail!("dispatch.chunk_max_entries must be greater than 0");
    }

    if config.chunk_max_bytes == 0 {
        bail!("dispatch.chunk_max_bytes must be greater than 0");
    }

    if config.batch_window_secs == 0 {
        bail!("dispatch.batch_window_secs must be greater than 0");
    }

    if config.breaker_key.trim().is_empty() {
        bail!("dispatch.breaker_key must not be empty");
    }

    if config.max_retries > 20 {
        warn!(
            max_retries = config.max_retries,
            "dispatch.max_retries is very large; failed batches will wait a long time before persisting"
        );
    }

    Ok(())
}

fn validate_breaker_config(config: &BreakerConfig) -> Result<()> {
    if config.failure_threshold == 0 {
        bail!("breaker.failure_threshold must be greater than 0");
    }

    if config.success_threshold == 0 {
        bail!("breaker.success_threshold must be greater than 0");
    }

    if config.timeout_secs == 0 {
        bail!("breaker.timeout_secs must be greater than 0");
    }

    Ok(())
}

fn validate_endpoint_config(config: &EndpointConfig) -> Result<()> {
    for url in [Some(config.url.as_str()), config.beacon_url.as_deref()]
        .into_iter()
        .flatten()
    {
        if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!(
                "Endpoint URL '{}' must start with http:// or https://\n\n\
                How to fix:\n\
                  • Environment: export {}ENDPOINT_URL=https://api.example.com/clicks\n\
                  • TOML: [endpoint]\n              url = \"https://api.example.com/clicks\"\n",
                url,
                ENV_PREFIX
            );
        }
    }

    Ok(())
}

fn validate_storage_config(config: &StorageConfig) -> Result<()> {
    if config.snapshot_key.trim().is_empty() {
        bail!("storage.snapshot_key must not be empty");
    }

    if config.backend == StorageBackend::Fs && config.path.is_empty() {
        bail!(
            "Filesystem path is required\n\n\
            How to fix:\n\
              • Environment: export {}STORAGE_PATH=/var/lib/clicktally\n\
              • TOML: [storage]\n              path = \"/var/lib/clicktally\"\n",
            ENV_PREFIX
        );
    }

    Ok(())
}
