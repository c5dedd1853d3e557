// clicktally-core - Pure data model for the click telemetry pipeline
//
// Philosophy: everything here is deterministic and side-effect free.
// Buffering, scheduling and network delivery live in the crates above this one.
//
// - model: click classifications, records and entity id normalization
// - payload: wire payload, partitioning, chunk planning, batch ids
// - snapshot: durable serialization of the buffer

pub mod model;
pub mod payload;
pub mod snapshot;

pub use model::{normalize_entity_id, ClickClassification, ClickRecord, ID_PREFIX_SEPARATOR};
pub use payload::{
    batch_window_start, chunk_batch_id, generate_batch_id, plan_chunks, BatchIdIssuer,
    BatchPayload, ChunkLimits, IngestResponse, PlannedChunk,
};
pub use snapshot::{PersistedSnapshot, SnapshotError, SNAPSHOT_VERSION};
