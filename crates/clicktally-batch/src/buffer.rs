// Bounded click buffer
//
// Maps a normalized entity id to its accumulated record. A flush takes the
// whole generation in one step, so increments arriving while a send is in
// flight land in a fresh map.

use clicktally_core::{ClickClassification, ClickRecord};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BufferLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub entry_size_estimate: usize,
    /// Force a flush once buffered entries have gone this long without a
    /// successful flush.
    pub stale_after: Duration,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_bytes: 512 * 1024,
            entry_size_estimate: 256,
            stale_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
pub struct ClickBuffer {
    entries: HashMap<String, ClickRecord>,
    limits: BufferLimits,
    last_success: Instant,
    /// When the first entry of the current generation was written.
    first_write: Option<Instant>,
}

impl ClickBuffer {
    pub fn new(limits: BufferLimits, now: Instant) -> Self {
        Self {
            entries: HashMap::new(),
            limits,
            last_success: now,
            first_write: None,
        }
    }

    pub fn limits(&self) -> &BufferLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ClickRecord> {
        self.entries.get(key)
    }

    /// Add one click under `key`, returning the new count.
    ///
    /// An existing entry keeps its classification; its shop id is only filled
    /// in when it had none.
    pub fn increment(
        &mut self,
        key: &str,
        shop_id: Option<String>,
        classification: ClickClassification,
        now: Instant,
    ) -> u64 {
        if self.entries.is_empty() {
            self.first_write = Some(now);
        }

        match self.entries.get_mut(key) {
            Some(record) => {
                record.absorb(ClickRecord::new(key, shop_id, classification));
                record.count
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    ClickRecord::new(key, shop_id, classification),
                );
                1
            }
        }
    }

    pub fn estimated_bytes(&self, current_size: usize) -> usize {
        current_size.saturating_mul(self.limits.entry_size_estimate)
    }

    /// Whether a buffer of `current_size` entries must be flushed before
    /// accepting more.
    pub fn should_force_flush(&self, current_size: usize, now: Instant) -> bool {
        current_size >= self.limits.max_entries
            || self.estimated_bytes(current_size) > self.limits.max_bytes
            || (current_size > 0 && self.stale_for(now) > self.limits.stale_after)
    }

    /// How long the buffered entries have waited without a successful flush.
    /// Idle time with an empty buffer does not count. Records merged back
    /// after a failed send are measured from the last success.
    fn stale_for(&self, now: Instant) -> Duration {
        let since = match self.first_write {
            Some(first_write) => first_write.max(self.last_success),
            None => self.last_success,
        };
        now.saturating_duration_since(since)
    }

    /// Take the current generation and leave an empty map behind.
    pub fn snapshot_and_clear(&mut self) -> Vec<ClickRecord> {
        self.first_write = None;
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Copy of the current contents without clearing.
    pub fn records(&self) -> Vec<ClickRecord> {
        self.entries.values().cloned().collect()
    }

    /// Fold records back in additively. Returns how many were merged.
    pub fn merge(&mut self, records: impl IntoIterator<Item = ClickRecord>) -> usize {
        let mut merged = 0;
        for record in records {
            merged += 1;
            match self.entries.get_mut(&record.entity_id) {
                Some(existing) => existing.absorb(record),
                None => {
                    self.entries.insert(record.entity_id.clone(), record);
                }
            }
        }
        if merged > 0 {
            debug!(merged, buffered = self.entries.len(), "Merged records into buffer");
        }
        merged
    }

    pub fn mark_flush_success(&mut self, now: Instant) {
        self.last_success = now;
    }

    pub fn last_success(&self) -> Instant {
        self.last_success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(limits: BufferLimits) -> (ClickBuffer, Instant) {
        let now = Instant::now();
        (ClickBuffer::new(limits, now), now)
    }

    #[test]
    fn test_increment_accumulates() {
        let (mut buf, now) = buffer(BufferLimits::default());
        assert_eq!(buf.increment("A", None, ClickClassification::Product, now), 1);
        assert_eq!(buf.increment("A", None, ClickClassification::Product, now), 2);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_increment_preserves_metadata() {
        let (mut buf, now) = buffer(BufferLimits::default());
        buf.increment(
            "A",
            Some("S1".to_string()),
            ClickClassification::ProductUnderShop,
            now,
        );
        buf.increment("A", None, ClickClassification::Product, now);

        let record = buf.get("A").unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.classification, ClickClassification::ProductUnderShop);
        assert_eq!(record.shop_id.as_deref(), Some("S1"));
    }

    #[test]
    fn test_should_force_flush_on_entry_limit() {
        let limits = BufferLimits {
            max_entries: 3,
            ..Default::default()
        };
        let (buf, now) = buffer(limits);
        assert!(!buf.should_force_flush(2, now));
        assert!(buf.should_force_flush(3, now));
    }

    #[test]
    fn test_should_force_flush_on_memory_estimate() {
        let limits = BufferLimits {
            max_entries: 1_000,
            max_bytes: 1_000,
            entry_size_estimate: 100,
            ..Default::default()
        };
        let (buf, now) = buffer(limits);
        assert!(!buf.should_force_flush(10, now));
        assert!(buf.should_force_flush(11, now));
    }

    #[test]
    fn test_should_force_flush_when_stale() {
        let limits = BufferLimits {
            stale_after: Duration::from_secs(300),
            ..Default::default()
        };
        let (mut buf, now) = buffer(limits);
        let later = now + Duration::from_secs(301);
        assert!(buf.should_force_flush(1, later));

        buf.mark_flush_success(later);
        assert!(!buf.should_force_flush(1, later));
    }

    #[test]
    fn test_idle_empty_buffer_is_not_stale() {
        let (mut buf, now) = buffer(BufferLimits::default());
        let after_idle = now + Duration::from_secs(600);

        assert!(!buf.should_force_flush(0, after_idle));
        buf.increment("A", None, ClickClassification::Product, after_idle);
        assert!(!buf.should_force_flush(1, after_idle));
        assert!(!buf.should_force_flush(1, after_idle + Duration::from_secs(300)));
        assert!(buf.should_force_flush(1, after_idle + Duration::from_secs(301)));

        // A new generation restarts the clock.
        buf.snapshot_and_clear();
        let next = after_idle + Duration::from_secs(900);
        buf.increment("B", None, ClickClassification::Product, next);
        assert!(!buf.should_force_flush(1, next + Duration::from_secs(1)));
    }

    #[test]
    fn test_snapshot_and_clear_starts_new_generation() {
        let (mut buf, now) = buffer(BufferLimits::default());
        buf.increment("A", None, ClickClassification::Product, now);
        buf.increment("B", None, ClickClassification::Shop, now);

        let taken = buf.snapshot_and_clear();
        assert_eq!(taken.len(), 2);
        assert!(buf.is_empty());

        buf.increment("A", None, ClickClassification::Product, now);
        assert_eq!(buf.get("A").unwrap().count, 1);
    }

    #[test]
    fn test_merge_is_additive() {
        let (mut buf, now) = buffer(BufferLimits::default());
        buf.increment("A", None, ClickClassification::Product, now);

        let merged = buf.merge(vec![
            ClickRecord::new("A", None, ClickClassification::Product).with_count(2),
            ClickRecord::new("B", None, ClickClassification::Shop),
        ]);

        assert_eq!(merged, 2);
        assert_eq!(buf.get("A").unwrap().count, 3);
        assert_eq!(buf.get("B").unwrap().count, 1);
    }
}
