// Durable snapshot of the click buffer
//
// The store holds at most one snapshot under `storage.snapshot_key`. It is
// either a mirror of the live buffer (written on hide, unload and dispose)
// or records deferred after exhausted retries that are no longer in memory.
// Writing a mirror first pulls deferred records back into the buffer so
// neither kind overwrites the other.

use super::lifecycle::Signal;
use super::Inner;
use clicktally_batch::ClickBuffer;
use clicktally_core::{ClickRecord, PersistedSnapshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What the durable store is known to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StoredSnapshot {
    /// Not read yet; may hold records that are not in memory.
    Unknown,
    Empty,
    /// Nothing that is not also in memory.
    Mirror,
    /// Records that exist only in storage.
    Deferred,
}

impl StoredSnapshot {
    pub(super) fn may_hold_foreign_records(self) -> bool {
        matches!(self, StoredSnapshot::Unknown | StoredSnapshot::Deferred)
    }
}

fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Inner {
    fn snapshot_key(&self) -> &str {
        &self.config.storage.snapshot_key
    }

    /// Read and decode the stored snapshot. An undecodable snapshot is logged
    /// and treated as absent.
    async fn read_snapshot(&self) -> clicktally_writer::Result<Option<PersistedSnapshot>> {
        let key = self.snapshot_key();
        let Some(raw) = self.store.read(key).await? else {
            return Ok(None);
        };

        match PersistedSnapshot::decode(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding unreadable click snapshot");
                Ok(None)
            }
        }
    }

    /// Pull records that only exist in storage back into the buffer.
    /// Returns how many were restored, or `None` if storage failed.
    async fn absorb_stored(&self) -> Option<usize> {
        let snapshot = match self.read_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(key = %self.snapshot_key(), error = %e, "Failed to read click snapshot");
                return None;
            }
        };

        let mut state = self.state.lock();
        let restored = match snapshot {
            Some(snapshot) => state.buffer.merge(snapshot.records),
            None => 0,
        };
        // Whatever storage still holds is now also in memory.
        state.stored = StoredSnapshot::Mirror;
        Some(restored)
    }

    /// Merge a persisted snapshot into the buffer, delete it, and schedule an
    /// immediate flush if anything came back.
    pub(super) async fn load_and_merge(&self) -> usize {
        let Some(restored) = self.absorb_stored().await else {
            return 0;
        };

        match self.store.remove(self.snapshot_key()).await {
            Ok(()) => self.state.lock().stored = StoredSnapshot::Empty,
            Err(e) => {
                warn!(key = %self.snapshot_key(), error = %e, "Failed to remove click snapshot")
            }
        }

        if restored > 0 {
            let mut state = self.state.lock();
            state.timer_armed = true;
            self.signal(Signal::Arm(Instant::now()));
            info!(entries = restored, "Restored persisted clicks");
        }

        restored
    }

    /// Write the live buffer to storage, or clear storage when the buffer is
    /// empty.
    pub(super) async fn persist(&self) {
        let foreign = self.state.lock().stored.may_hold_foreign_records();
        if foreign && self.absorb_stored().await.is_none() {
            error!("Skipping persist; stored snapshot could not be read");
            return;
        }

        let records = self.state.lock().buffer.records();
        let key = self.snapshot_key();

        if records.is_empty() {
            match self.store.remove(key).await {
                Ok(()) => self.state.lock().stored = StoredSnapshot::Empty,
                Err(e) => warn!(key = %key, error = %e, "Failed to clear click snapshot"),
            }
            return;
        }

        let entries = records.len();
        if self.write_snapshot(records).await {
            self.state.lock().stored = StoredSnapshot::Mirror;
            debug!(key = %key, entries, "Persisted click buffer");
        }
    }

    /// Last resort after exhausted retries: move `records` out of memory into
    /// storage, on top of anything already deferred there.
    pub(super) async fn defer(&self, records: Vec<ClickRecord>) {
        let mut records = records;
        let entries = records.len();

        if self.state.lock().stored.may_hold_foreign_records() {
            match self.read_snapshot().await {
                Ok(Some(existing)) => {
                    let mut combined = {
                        let state = self.state.lock();
                        ClickBuffer::new(
                            state.buffer.limits().clone(),
                            state.buffer.last_success(),
                        )
                    };
                    combined.merge(existing.records);
                    combined.merge(records);
                    records = combined.snapshot_and_clear();
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        entries,
                        error = %e,
                        "Dropping clicks; durable storage is unavailable"
                    );
                    return;
                }
            }
        }

        if self.write_snapshot(records).await {
            self.state.lock().stored = StoredSnapshot::Deferred;
            info!(entries, "Deferred clicks to durable storage");
        } else {
            error!(entries, "Dropping clicks; durable storage rejected the snapshot");
        }
    }

    async fn write_snapshot(&self, records: Vec<ClickRecord>) -> bool {
        let key = self.snapshot_key();
        let encoded = match PersistedSnapshot::new(records, now_unix_ms()).encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to encode click snapshot");
                return false;
            }
        };

        match self.store.write(key, encoded).await {
            Ok(()) => true,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to write click snapshot");
                false
            }
        }
    }
}
