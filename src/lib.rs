// clicktally - Client-side click telemetry pipeline
//
// Records debounced clicks into a bounded buffer and ships them as
// idempotent batches behind a circuit breaker, with a durable snapshot as the
// last resort when the endpoint stays unreachable.

pub mod init;
mod pipeline;

pub use pipeline::{Collaborators, PipelineStats, Telemetry, ANONYMOUS_USER};

pub use clicktally_breaker::{
    BreakerError, BreakerOptions, CircuitBreaker, CircuitState, CircuitStats,
};
pub use clicktally_config::RuntimeConfig;
pub use clicktally_core::{BatchPayload, ClickClassification, ClickRecord, IngestResponse};
pub use clicktally_writer::{
    BatchSink, Beacon, HttpBeacon, HttpSink, NoopBeacon, OpenDalStore, SnapshotStore, WriterError,
};
