//! Error types for the outbound collaborators

use thiserror::Error;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// E001: Batch endpoint unreachable or connection failed
    E001SinkUnreachable,
    /// E002: Batch endpoint rejected the payload
    E002SinkRejected,
    /// E003: Batch endpoint returned an unparseable response
    E003InvalidResponse,
    /// E004: Configuration missing or invalid
    E004InvalidConfig,
    /// E005: Durable storage operation failed
    E005StorageFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E001SinkUnreachable => "E001",
            Self::E002SinkRejected => "E002",
            Self::E003InvalidResponse => "E003",
            Self::E004InvalidConfig => "E004",
            Self::E005StorageFailure => "E005",
        }
    }
}

/// Errors raised while delivering batches or touching durable storage
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("[{code}] Batch endpoint unreachable at '{url}': {message}")]
    SinkUnreachable {
        code: &'static str,
        url: String,
        message: String,
    },

    #[error("[{code}] Batch endpoint rejected batch (status {status}): {message}")]
    SinkRejected {
        code: &'static str,
        status: u16,
        message: String,
    },

    #[error("[{code}] Batch endpoint reported failure: {message}")]
    BatchFailed { code: &'static str, message: String },

    #[error("[{code}] Invalid response from batch endpoint: {message}")]
    InvalidResponse { code: &'static str, message: String },

    #[error("[{code}] Invalid configuration: {message}")]
    InvalidConfig { code: &'static str, message: String },

    #[error("[{code}] Storage operation '{operation}' failed for '{key}': {message}")]
    Storage {
        code: &'static str,
        operation: &'static str,
        key: String,
        message: String,
    },
}

impl WriterError {
    pub fn sink_unreachable(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkUnreachable {
            code: ErrorCode::E001SinkUnreachable.as_str(),
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn sink_rejected(status: u16, message: impl Into<String>) -> Self {
        Self::SinkRejected {
            code: ErrorCode::E002SinkRejected.as_str(),
            status,
            message: message.into(),
        }
    }

    /// The endpoint answered but reported `success: false`.
    pub fn batch_failed(message: impl Into<String>) -> Self {
        Self::BatchFailed {
            code: ErrorCode::E002SinkRejected.as_str(),
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            code: ErrorCode::E003InvalidResponse.as_str(),
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            code: ErrorCode::E004InvalidConfig.as_str(),
            message: message.into(),
        }
    }

    pub fn storage(operation: &'static str, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            code: ErrorCode::E005StorageFailure.as_str(),
            operation,
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SinkUnreachable { .. } => ErrorCode::E001SinkUnreachable,
            Self::SinkRejected { .. } | Self::BatchFailed { .. } => ErrorCode::E002SinkRejected,
            Self::InvalidResponse { .. } => ErrorCode::E003InvalidResponse,
            Self::InvalidConfig { .. } => ErrorCode::E004InvalidConfig,
            Self::Storage { .. } => ErrorCode::E005StorageFailure,
        }
    }
}

/// Result type alias for WriterError
pub type Result<T> = std::result::Result<T, WriterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_codes() {
        let err = WriterError::sink_rejected(503, "overloaded");
        assert_eq!(err.code(), ErrorCode::E002SinkRejected);
        assert!(err.to_string().starts_with("[E002]"));

        let err = WriterError::storage("write", "click_buffer.json", "quota exceeded");
        assert!(err.to_string().contains("click_buffer.json"));
    }
}
