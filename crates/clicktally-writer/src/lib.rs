// clicktally-writer - Outbound collaborators for the click pipeline
//
// - sink: batch delivery to the ingest endpoint
// - beacon: fire-and-forget delivery during shutdown
// - store: durable snapshot storage via OpenDAL

mod beacon;
mod error;
mod sink;
mod store;

pub use beacon::{Beacon, HttpBeacon, NoopBeacon};
pub use error::{ErrorCode, Result, WriterError};
pub use sink::{BatchSink, HttpSink};
pub use store::{OpenDalStore, SnapshotStore};
