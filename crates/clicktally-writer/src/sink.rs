//! Batch delivery to the ingest endpoint.

use crate::error::{Result, WriterError};
use async_trait::async_trait;
use clicktally_config::EndpointConfig;
use clicktally_core::{BatchPayload, IngestResponse};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Destination for flushed batches.
///
/// A returned `IngestResponse` with `success == false` is a delivery failure
/// just like an `Err`; callers treat both the same way.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn send(&self, payload: &BatchPayload) -> Result<IngestResponse>;
}

/// POSTs JSON payloads to the configured endpoint.
#[derive(Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl HttpSink {
    pub fn new(config: &EndpointConfig, timeout: Duration) -> Result<Self> {
        if config.url.is_empty() {
            return Err(WriterError::invalid_config(
                "endpoint.url is required to deliver batches",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WriterError::invalid_config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            headers: parse_headers(&config.headers)?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BatchSink for HttpSink {
    async fn send(&self, payload: &BatchPayload) -> Result<IngestResponse> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(payload)
            .send()
            .await
            .map_err(|e| WriterError::sink_unreachable(&self.url, e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| WriterError::sink_unreachable(&self.url, e.to_string()))?;

        if !status.is_success() {
            return Err(WriterError::sink_rejected(
                status.as_u16(),
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }

        debug!(
            batch_id = %payload.batch_id,
            status = %status,
            entries = payload.entry_count(),
            "Batch endpoint responded"
        );

        parse_response(&body)
    }
}

/// Decode an ingest response body. An empty 2xx body counts as success.
pub(crate) fn parse_response(body: &[u8]) -> Result<IngestResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(IngestResponse::ok());
    }
    serde_json::from_slice(body).map_err(|e| WriterError::invalid_response(e.to_string()))
}

pub(crate) fn parse_headers(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut header_map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::try_from(key.as_str()).map_err(|e| {
            WriterError::invalid_config(format!("invalid header name '{}': {}", key, e))
        })?;
        let val = HeaderValue::from_str(value).map_err(|e| {
            WriterError::invalid_config(format!("invalid header value for '{}': {}", key, e))
        })?;
        header_map.insert(name, val);
    }
    Ok(header_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_parse_headers() {
        let headers = HashMap::from([
            ("Authorization".to_string(), "Bearer token123".to_string()),
            ("X-Client".to_string(), "storefront".to_string()),
        ]);

        let header_map = parse_headers(&headers).unwrap();
        assert_eq!(header_map.len(), 2);
        assert_eq!(header_map.get("Authorization").unwrap(), "Bearer token123");
    }

    #[test]
    fn test_parse_headers_rejects_bad_name() {
        let headers = HashMap::from([("bad header".to_string(), "x".to_string())]);
        let err = parse_headers(&headers).unwrap_err();
        assert_eq!(err.code(), ErrorCode::E004InvalidConfig);
    }

    #[test]
    fn test_parse_response() {
        assert!(parse_response(b"").unwrap().success);
        assert!(parse_response(br#"{"success":true}"#).unwrap().success);

        let failed = parse_response(br#"{"success":false,"error":"quota"}"#).unwrap();
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("quota"));

        let err = parse_response(b"<html>").unwrap_err();
        assert_eq!(err.code(), ErrorCode::E003InvalidResponse);
    }

    #[test]
    fn test_sink_requires_url() {
        let err = HttpSink::new(&EndpointConfig::default(), Duration::from_secs(5))
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::E004InvalidConfig);
    }
}
