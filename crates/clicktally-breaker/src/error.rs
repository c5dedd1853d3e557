//! Error type returned by guarded operations.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Short-circuited without running the operation.
    #[error("circuit '{key}' is open; next attempt in {retry_in:?}")]
    Open { key: String, retry_in: Duration },

    /// The operation did not settle within the per-call timeout.
    #[error("operation on circuit '{key}' timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    /// The operation itself failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BreakerError::Timeout { .. })
    }
}
