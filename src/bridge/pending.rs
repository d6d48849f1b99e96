//! Self-heard-RF correlation table: tracks reverse-path sends awaiting
//! their own echo so the collector-facing publish can carry the real radio
//! packet ID instead of a locally generated placeholder.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PendingSend {
    pub local_packet_id: u32,
    pub created_at: Instant,
}

type PendingKey = (String, Option<String>);

/// Guarded by one mutex; lookups and removals are O(1).
#[derive(Default)]
pub struct PendingSendTable {
    entries: Mutex<HashMap<PendingKey, PendingSend>>,
}

impl PendingSendTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, text: String, destination: Option<String>, local_packet_id: u32) {
        let mut entries = self.entries.lock().expect("pending table mutex poisoned");
        entries.insert(
            (text, destination),
            PendingSend {
                local_packet_id,
                created_at: Instant::now(),
            },
        );
    }

    /// Removes and returns the entry matching `(text, destination)`, if any.
    pub fn take(&self, text: &str, destination: Option<&str>) -> Option<PendingSend> {
        let key = (text.to_string(), destination.map(str::to_string));
        self.entries
            .lock()
            .expect("pending table mutex poisoned")
            .remove(&key)
    }

    /// Removes and returns every entry older than `timeout`, for the
    /// fallback-echo sweep.
    pub fn take_expired(&self, timeout: Duration) -> Vec<(PendingKey, PendingSend)> {
        let mut entries = self.entries.lock().expect("pending table mutex poisoned");
        let expired_keys: Vec<PendingKey> = entries
            .iter()
            .filter(|(_, v)| v.created_at.elapsed() >= timeout)
            .map(|(k, _)| k.clone())
            .collect();
        expired_keys
            .into_iter()
            .filter_map(|k| entries.remove(&k).map(|v| (k, v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pending table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_matches_exact_key() {
        let table = PendingSendTable::new();
        table.register("hi".into(), None, 7);
        let entry = table.take("hi", None).unwrap();
        assert_eq!(entry.local_packet_id, 7);
        assert!(table.is_empty());
    }

    #[test]
    fn take_does_not_match_different_destination() {
        let table = PendingSendTable::new();
        table.register("hi".into(), Some("!abcd1234".into()), 7);
        assert!(table.take("hi", None).is_none());
        assert!(table.take("hi", Some("!abcd1234")).is_some());
    }

    #[test]
    fn take_expired_removes_only_old_entries() {
        let table = PendingSendTable::new();
        table.register("hi".into(), None, 1);
        let expired = table.take_expired(Duration::from_secs(0));
        assert_eq!(expired.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn take_expired_leaves_fresh_entries() {
        let table = PendingSendTable::new();
        table.register("hi".into(), None, 1);
        let expired = table.take_expired(Duration::from_secs(60));
        assert!(expired.is_empty());
        assert_eq!(table.len(), 1);
    }
}
