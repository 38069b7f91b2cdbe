use std::collections::HashMap;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Short stable key for a set of log fields.
pub fn dedup_key(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Suppresses identical log lines seen again within `window`. Best effort:
/// the table is pruned lazily and keys are truncated hashes.
pub struct LogDeduper {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl LogDeduper {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    pub fn should_emit(&mut self, fields: &[&str]) -> bool {
        self.should_emit_at(fields, Instant::now())
    }

    pub fn should_emit_at(&mut self, fields: &[&str], now: Instant) -> bool {
        let window = self.window;
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < window);
        let key = dedup_key(fields);
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_stable_and_field_sensitive() {
        let a = dedup_key(&["i1", "info", "hello"]);
        assert_eq!(a.len(), 16);
        assert_eq!(a, dedup_key(&["i1", "info", "hello"]));
        assert_ne!(a, dedup_key(&["i1", "warn", "hello"]));
        // Field boundaries matter.
        assert_ne!(dedup_key(&["ab", "c"]), dedup_key(&["a", "bc"]));
    }

    #[test]
    fn test_window_suppresses_then_expires() {
        let mut dedup = LogDeduper::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(dedup.should_emit_at(&["x"], t0));
        assert!(!dedup.should_emit_at(&["x"], t0 + Duration::from_millis(50)));
        assert!(dedup.should_emit_at(&["y"], t0 + Duration::from_millis(50)));
        assert!(dedup.should_emit_at(&["x"], t0 + Duration::from_millis(150)));
        assert_eq!(dedup.len(), 1);
    }
}
