//! Durable serialization of the click buffer.
//!
//! Written as a last-resort fallback and on page hide/unload, read back once at
//! startup. The format is versioned JSON so older snapshots are rejected
//! instead of being merged with the wrong shape.

use crate::model::ClickRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub version: u32,
    pub saved_at_ms: i64,
    pub records: Vec<ClickRecord>,
}

impl PersistedSnapshot {
    pub fn new(mut records: Vec<ClickRecord>, saved_at_ms: i64) -> Self {
        records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Self {
            version: SNAPSHOT_VERSION,
            saved_at_ms,
            records,
        }
    }

    pub fn encode(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, SnapshotError> {
        let snapshot: PersistedSnapshot = serde_json::from_str(raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClickClassification;

    #[test]
    fn test_decode_restores_records() {
        let snapshot = PersistedSnapshot::new(
            vec![
                ClickRecord::new("B", None, ClickClassification::Shop),
                ClickRecord::new("A", Some("S".into()), ClickClassification::ProductUnderShop)
                    .with_count(3),
            ],
            1_700_000_000_000,
        );

        let decoded = PersistedSnapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.records[0].entity_id, "A");
        assert_eq!(decoded.records[0].count, 3);
        assert_eq!(decoded.records[0].shop_id.as_deref(), Some("S"));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let raw = r#"{"version":99,"saved_at_ms":0,"records":[]}"#;
        assert!(matches!(
            PersistedSnapshot::decode(raw),
            Err(SnapshotError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            PersistedSnapshot::decode("not json"),
            Err(SnapshotError::Malformed(_))
        ));
    }
}
