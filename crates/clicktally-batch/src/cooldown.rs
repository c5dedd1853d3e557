use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Last-recorded time per entity, used to collapse rapid repeat events.
///
/// Entries are overwritten, never evicted: the key space is bounded by the
/// entities a user is currently looking at.
#[derive(Debug)]
pub struct CooldownTable {
    window: Duration,
    last_recorded: HashMap<String, Instant>,
}

impl CooldownTable {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_recorded: HashMap::new(),
        }
    }

    /// Returns true and stamps `entity_id` if it is outside its cooldown.
    /// Inside the window the call changes nothing.
    pub fn try_record(&mut self, entity_id: &str, now: Instant) -> bool {
        if let Some(last) = self.last_recorded.get(entity_id) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }
        self.last_recorded.insert(entity_id.to_string(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_inside_window_is_suppressed() {
        let mut table = CooldownTable::new(Duration::from_secs(1));
        let now = Instant::now();

        assert!(table.try_record("A", now));
        assert!(!table.try_record("A", now + Duration::from_millis(500)));
        assert!(table.try_record("A", now + Duration::from_millis(1_000)));
    }

    #[test]
    fn test_suppressed_call_does_not_extend_window() {
        let mut table = CooldownTable::new(Duration::from_secs(1));
        let now = Instant::now();

        assert!(table.try_record("A", now));
        assert!(!table.try_record("A", now + Duration::from_millis(900)));
        assert!(table.try_record("A", now + Duration::from_millis(1_100)));
    }

    #[test]
    fn test_entities_are_independent() {
        let mut table = CooldownTable::new(Duration::from_secs(1));
        let now = Instant::now();

        assert!(table.try_record("A", now));
        assert!(table.try_record("B", now));
        assert!(!table.try_record("A", now + Duration::from_millis(10)));
        assert!(!table.try_record("B", now + Duration::from_millis(10)));
    }
}
