//! Fire-and-forget delivery used while the host is shutting down.

use crate::error::{Result, WriterError};
use crate::sink::parse_headers;
use clicktally_config::EndpointConfig;
use clicktally_core::BatchPayload;
use reqwest::header::HeaderMap;
use tracing::{debug, warn};

/// Best-effort transport that outlives the caller.
///
/// `send` must not block. It returns whether the payload was handed off;
/// `false` means the caller keeps responsibility for the data.
pub trait Beacon: Send + Sync {
    fn send(&self, payload: BatchPayload) -> bool;
}

/// Spawns a detached POST on the current tokio runtime.
#[derive(Clone)]
pub struct HttpBeacon {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl HttpBeacon {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let url = config.beacon_url();
        if url.is_empty() {
            return Err(WriterError::invalid_config(
                "endpoint.beacon_url or endpoint.url is required for unload delivery",
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers: parse_headers(&config.headers)?,
        })
    }
}

impl Beacon for HttpBeacon {
    fn send(&self, payload: BatchPayload) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available for beacon delivery");
            return false;
        };

        let request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&payload);
        let batch_id = payload.batch_id;

        handle.spawn(async move {
            match request.send().await {
                Ok(response) => {
                    debug!(batch_id = %batch_id, status = %response.status(), "Beacon delivered")
                }
                Err(e) => debug!(batch_id = %batch_id, error = %e, "Beacon delivery failed"),
            }
        });

        true
    }
}

/// A beacon that never accepts anything, for hosts without an unload transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBeacon;

impl Beacon for NoopBeacon {
    fn send(&self, _payload: BatchPayload) -> bool {
        false
    }
}
