//! Wire payload for the batch-ingest endpoint.
//!
//! A [`BatchPayload`] is the only format this crate owns on the wire. It is
//! serialized with camelCase keys:
//!
//! ```text
//! { "batchId": "...", "productClicks": {..}, "shopScopedProductClicks": {..},
//!   "shopClicks": {..}, "shopIdByProduct": {..} }
//! ```
//!
//! The receiving side applies counter increments exactly once per distinct
//! `batchId`, so ids must be stable across retries of the same logical batch.

use crate::model::{ClickClassification, ClickRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// One outbound delivery unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub batch_id: String,
    #[serde(default)]
    pub product_clicks: BTreeMap<String, u64>,
    #[serde(default)]
    pub shop_scoped_product_clicks: BTreeMap<String, u64>,
    #[serde(default)]
    pub shop_clicks: BTreeMap<String, u64>,
    #[serde(default)]
    pub shop_id_by_product: BTreeMap<String, String>,
}

impl BatchPayload {
    /// Partition records into the three counter buckets.
    ///
    /// Shop ids are carried only for `ProductUnderShop` records.
    pub fn from_records<'a>(
        batch_id: impl Into<String>,
        records: impl IntoIterator<Item = &'a ClickRecord>,
    ) -> Self {
        let mut payload = BatchPayload {
            batch_id: batch_id.into(),
            ..Default::default()
        };

        for record in records {
            let bucket = match record.classification {
                ClickClassification::Product => &mut payload.product_clicks,
                ClickClassification::ProductUnderShop => {
                    if let Some(shop_id) = &record.shop_id {
                        payload
                            .shop_id_by_product
                            .insert(record.entity_id.clone(), shop_id.clone());
                    }
                    &mut payload.shop_scoped_product_clicks
                }
                ClickClassification::Shop => &mut payload.shop_clicks,
            };
            *bucket.entry(record.entity_id.clone()).or_insert(0) += record.count;
        }

        payload
    }

    /// Total click entries across all buckets.
    pub fn entry_count(&self) -> usize {
        self.product_clicks.len() + self.shop_scoped_product_clicks.len() + self.shop_clicks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Serialized JSON size in bytes.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len())
    }
}

/// Response body of the batch-ingest endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Size ceilings above which a batch is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_bytes: 1_000_000,
        }
    }
}

/// A payload ready to send, plus the records it was built from so a failed
/// send can return them to the buffer.
#[derive(Debug, Clone)]
pub struct PlannedChunk {
    /// Position of this chunk in its batch. Always 0 for an unsplit batch.
    pub index: usize,
    pub payload: BatchPayload,
    pub records: Vec<ClickRecord>,
}

/// Build the ordered list of payloads for one flush.
///
/// A batch within both limits goes out as a single payload under `batch_id`.
/// Larger batches are split into evenly sized chunks, each no larger than
/// `max_entries`, with ids from [`chunk_batch_id`]. A chunk whose encoding
/// still exceeds `max_bytes` is halved until it fits or holds one record.
///
/// `first_index` continues a batch whose earlier chunks were already
/// acknowledged: numbering starts there and the result is always suffixed,
/// so no acknowledged id is sent again.
pub fn plan_chunks(
    batch_id: &str,
    mut records: Vec<ClickRecord>,
    limits: ChunkLimits,
    first_index: usize,
) -> Vec<PlannedChunk> {
    if records.is_empty() {
        return Vec::new();
    }

    records.sort_by(|a, b| {
        a.classification
            .cmp(&b.classification)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });

    let entries = records.len();
    if first_index == 0 && entries <= limits.max_entries {
        let whole = BatchPayload::from_records(batch_id, &records);
        if whole.encoded_len() <= limits.max_bytes {
            return vec![PlannedChunk {
                index: 0,
                payload: whole,
                records,
            }];
        }
    }

    // Longest id any chunk of this batch can get.
    let sizing_id = chunk_batch_id(batch_id, first_index + entries);
    let bytes = BatchPayload::from_records(sizing_id.as_str(), &records).encoded_len();

    let by_entries = entries.div_ceil(limits.max_entries.max(1));
    let by_bytes = bytes.div_ceil(limits.max_bytes.max(1));
    let chunk_count = by_entries.max(by_bytes).clamp(1, entries);
    let chunk_len = entries.div_ceil(chunk_count);

    let mut slices = Vec::with_capacity(chunk_count);
    for slice in records.chunks(chunk_len) {
        split_oversized(&sizing_id, slice, limits.max_bytes, &mut slices);
    }

    slices
        .into_iter()
        .enumerate()
        .map(|(offset, slice)| {
            let index = first_index + offset;
            PlannedChunk {
                index,
                payload: BatchPayload::from_records(chunk_batch_id(batch_id, index), slice),
                records: slice.to_vec(),
            }
        })
        .collect()
}

fn split_oversized<'a>(
    sizing_id: &str,
    slice: &'a [ClickRecord],
    max_bytes: usize,
    out: &mut Vec<&'a [ClickRecord]>,
) {
    if slice.len() > 1 && BatchPayload::from_records(sizing_id, slice).encoded_len() > max_bytes {
        let (head, tail) = slice.split_at(slice.len() / 2);
        split_oversized(sizing_id, head, max_bytes, out);
        split_oversized(sizing_id, tail, max_bytes, out);
    } else {
        out.push(slice);
    }
}

/// Id for the `index`th chunk of a split batch.
pub fn chunk_batch_id(batch_id: &str, index: usize) -> String {
    format!("{}_chunk_{}", batch_id, index)
}

/// Start of the idempotency window containing `now_unix_ms`.
pub fn batch_window_start(now_unix_ms: i64, window: Duration) -> i64 {
    let window_ms = (window.as_millis() as i64).max(1);
    now_unix_ms.div_euclid(window_ms) * window_ms
}

/// Deterministic idempotency key for a user inside one time window.
///
/// Every call for the same user inside the same window yields the same id, so
/// a retried batch is recognised as a duplicate by the backend.
pub fn generate_batch_id(user_id: &str, now_unix_ms: i64, window: Duration) -> String {
    let window_start = batch_window_start(now_unix_ms, window);
    let digest = blake3::hash(format!("{}:{}", user_id, window_start).as_bytes());
    format!("batch_{}", &digest.to_hex()[..32])
}

/// Hands out one id per logical batch.
///
/// The first batch a user sends in a window gets the plain
/// [`generate_batch_id`] value. Later batches in the same window get a
/// sequence suffix, since the backend would discard a second, different
/// payload under an id it has already applied.
#[derive(Debug, Default)]
pub struct BatchIdIssuer {
    window_start: i64,
    issued: HashMap<String, u32>,
}

impl BatchIdIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, user_id: &str, now_unix_ms: i64, window: Duration) -> String {
        let window_start = batch_window_start(now_unix_ms, window);
        if window_start != self.window_start {
            self.window_start = window_start;
            self.issued.clear();
        }

        let base = generate_batch_id(user_id, now_unix_ms, window);
        let sequence = self.issued.entry(base.clone()).or_insert(0);
        let id = match *sequence {
            0 => base,
            n => format!("{}_{}", base, n),
        };
        *sequence += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(30);

    fn records(n: usize) -> Vec<ClickRecord> {
        (0..n)
            .map(|i| {
                ClickRecord::new(format!("p{:04}", i), None, ClickClassification::Product)
            })
            .collect()
    }

    #[test]
    fn test_partition_by_classification() {
        let input = vec![
            ClickRecord::new("A", None, ClickClassification::Product).with_count(2),
            ClickRecord::new("B", Some("S1".into()), ClickClassification::ProductUnderShop),
            ClickRecord::new("S1", None, ClickClassification::Shop).with_count(4),
            ClickRecord::new("C", Some("S9".into()), ClickClassification::Product),
        ];

        let payload = BatchPayload::from_records("batch_x", &input);

        assert_eq!(payload.product_clicks.get("A"), Some(&2));
        assert_eq!(payload.product_clicks.get("C"), Some(&1));
        assert_eq!(payload.shop_scoped_product_clicks.get("B"), Some(&1));
        assert_eq!(payload.shop_clicks.get("S1"), Some(&4));
        // Shop ids only travel with shop-scoped products
        assert_eq!(payload.shop_id_by_product.len(), 1);
        assert_eq!(payload.shop_id_by_product.get("B").map(String::as_str), Some("S1"));
        assert_eq!(payload.entry_count(), 4);
    }

    #[test]
    fn test_payload_uses_camel_case_keys() {
        let input = vec![ClickRecord::new(
            "B",
            Some("S1".into()),
            ClickClassification::ProductUnderShop,
        )];
        let json = serde_json::to_value(BatchPayload::from_records("batch_x", &input)).unwrap();

        assert_eq!(json["batchId"], "batch_x");
        assert_eq!(json["shopScopedProductClicks"]["B"], 1);
        assert_eq!(json["shopIdByProduct"]["B"], "S1");
        assert!(json["productClicks"].as_object().unwrap().is_empty());
        assert!(json["shopClicks"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_small_batch_is_not_split() {
        let chunks = plan_chunks("batch_x", records(10), ChunkLimits::default(), 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payload.batch_id, "batch_x");
        assert_eq!(chunks[0].payload.entry_count(), 10);
    }

    #[test]
    fn test_1200_entries_split_into_three_chunks() {
        let chunks = plan_chunks("batch_x", records(1200), ChunkLimits::default(), 0);

        assert_eq!(chunks.len(), 3);
        let ids: Vec<&str> = chunks.iter().map(|c| c.payload.batch_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["batch_x_chunk_0", "batch_x_chunk_1", "batch_x_chunk_2"]
        );
        for chunk in &chunks {
            assert!(chunk.payload.entry_count() <= 500);
            assert_eq!(chunk.payload.entry_count(), chunk.records.len());
        }
        let total: usize = chunks.iter().map(|c| c.payload.entry_count()).sum();
        assert_eq!(total, 1200);

        // Ordered: the first chunk holds the lowest ids
        assert!(chunks[0].payload.product_clicks.contains_key("p0000"));
        assert!(chunks[2].payload.product_clicks.contains_key("p1199"));
    }

    #[test]
    fn test_byte_ceiling_forces_split() {
        let limits = ChunkLimits {
            max_entries: 500,
            max_bytes: 200,
        };
        let chunks = plan_chunks("batch_x", records(20), limits, 0);

        assert!(chunks.len() > 1);
        let total: usize = chunks.iter().map(|c| c.records.len()).sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn test_continued_batch_keeps_numbering() {
        let chunks = plan_chunks("batch_x", records(800), ChunkLimits::default(), 1);

        let ids: Vec<&str> = chunks.iter().map(|c| c.payload.batch_id.as_str()).collect();
        assert_eq!(ids, vec!["batch_x_chunk_1", "batch_x_chunk_2"]);
        assert_eq!(chunks[0].index, 1);

        // Even a small remainder keeps its chunk suffix.
        let chunks = plan_chunks("batch_x", records(3), ChunkLimits::default(), 2);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payload.batch_id, "batch_x_chunk_2");
    }

    #[test]
    fn test_uneven_record_sizes_respect_byte_ceiling() {
        let mut input = records(9);
        input.push(ClickRecord::new(
            "x".repeat(400),
            None,
            ClickClassification::Product,
        ));
        let limits = ChunkLimits {
            max_entries: 500,
            max_bytes: 500,
        };

        let chunks = plan_chunks("batch_x", input, limits, 0);

        for chunk in &chunks {
            assert!(
                chunk.records.len() == 1 || chunk.payload.encoded_len() <= limits.max_bytes,
                "chunk {} is {} bytes",
                chunk.index,
                chunk.payload.encoded_len()
            );
        }
        let total: usize = chunks.iter().map(|c| c.records.len()).sum();
        assert_eq!(total, 10);
        let indices: Vec<usize> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, (0..chunks.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_issuer_gives_each_batch_in_a_window_its_own_id() {
        let base = 1_700_000_010_000;
        let mut issuer = BatchIdIssuer::new();

        let first = issuer.issue("user-1", base, WINDOW);
        let second = issuer.issue("user-1", base + 1_000, WINDOW);
        let third = issuer.issue("user-1", base + 2_000, WINDOW);

        assert_eq!(first, generate_batch_id("user-1", base, WINDOW));
        assert_eq!(second, format!("{}_1", first));
        assert_eq!(third, format!("{}_2", first));

        // Other users and later windows start from the plain id.
        assert_eq!(
            issuer.issue("user-2", base, WINDOW),
            generate_batch_id("user-2", base, WINDOW)
        );
        assert_eq!(
            issuer.issue("user-1", base + 30_000, WINDOW),
            generate_batch_id("user-1", base + 30_000, WINDOW)
        );
    }

    #[test]
    fn test_batch_id_stable_within_window() {
        let base = 1_700_000_010_000; // start of a 30s window
        let a = generate_batch_id("user-1", base, WINDOW);
        let b = generate_batch_id("user-1", base + 15_000, WINDOW);
        assert_eq!(a, b);
        assert!(a.starts_with("batch_"));
    }

    #[test]
    fn test_batch_id_changes_across_windows_and_users() {
        let base = 1_700_000_010_000;
        let a = generate_batch_id("user-1", base, WINDOW);
        assert_ne!(a, generate_batch_id("user-1", base + 30_000, WINDOW));
        assert_ne!(a, generate_batch_id("user-2", base, WINDOW));
    }

    #[test]
    fn test_window_start_floors() {
        assert_eq!(batch_window_start(59_999, WINDOW), 30_000);
        assert_eq!(batch_window_start(60_000, WINDOW), 60_000);
    }
}
