//! Discovered-bug container.
//!
//! Keyed by the user-visible bug id string; each id carries the monotonic
//! elapsed time since the detector clock started, recorded once at first
//! discovery. The same type serves as the per-tx container attached to message
//! results and as the process-global accumulator, so it is lock-protected.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

static DETECTOR_START: OnceLock<Instant> = OnceLock::new();

/// Start (or fetch) the process-global detector clock. Workers call this once
/// at startup so elapsed times measure the whole campaign.
pub fn init_detection_clock() -> Instant {
    *DETECTOR_START.get_or_init(Instant::now)
}

fn elapsed_since_start() -> Duration {
    let elapsed = init_detection_clock().elapsed();
    // Keep reported strings readable.
    Duration::from_micros(elapsed.as_micros() as u64)
}

#[derive(Debug, Default)]
pub struct BugMap {
    bugs: RwLock<HashMap<String, Duration>>,
}

impl BugMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Duration>> {
        match self.bugs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Duration>> {
        match self.bugs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a discovered bug id. Idempotent; the first call stamps the
    /// elapsed discovery time and returns `true`.
    pub fn cover_bug(&self, bug_id: &str) -> bool {
        let mut bugs = self.write();
        if bugs.contains_key(bug_id) {
            return false;
        }
        bugs.insert(bug_id.to_string(), elapsed_since_start());
        true
    }

    /// Set-union merge preserving the earliest (already stored) first-seen
    /// timestamp for known ids. Returns whether any new id appeared.
    pub fn update(&self, other: &BugMap) -> bool {
        let incoming = other.read();
        let mut bugs = self.write();
        let mut updated = false;
        for (id, elapsed) in incoming.iter() {
            if !bugs.contains_key(id) {
                bugs.insert(id.clone(), *elapsed);
                updated = true;
            }
        }
        updated
    }

    pub fn contains(&self, bug_id: &str) -> bool {
        self.read().contains_key(bug_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn reset(&self) {
        self.write().clear();
    }

    /// User-visible report: one `"<id>-<elapsed>"` string per bug, sorted for
    /// stable output.
    pub fn results(&self) -> Vec<String> {
        let bugs = self.read();
        let mut out: Vec<String> = bugs
            .iter()
            .map(|(id, elapsed)| format!("{id}-{elapsed:?}"))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cover_bug_is_idempotent() {
        let map = BugMap::new();
        assert!(map.cover_bug("SUICIDAL-0xabc-12-SELFDESTRUCT"));
        assert!(!map.cover_bug("SUICIDAL-0xabc-12-SELFDESTRUCT"));
        assert_eq!(map.len(), 1);
        assert!(map.contains("SUICIDAL-0xabc-12-SELFDESTRUCT"));
    }

    #[test]
    fn test_update_preserves_first_seen_timestamps() {
        let first = BugMap::new();
        first.cover_bug("OVERFLOW-0xabc-5-ADD");
        let stamped = *first.read().get("OVERFLOW-0xabc-5-ADD").unwrap();

        // A later map re-discovers the same bug with a later stamp.
        let second = BugMap::new();
        second.cover_bug("OVERFLOW-0xabc-5-ADD");
        second.cover_bug("SUICIDAL-0xdef-9-SELFDESTRUCT");

        assert!(first.update(&second));
        assert_eq!(first.len(), 2);
        assert_eq!(*first.read().get("OVERFLOW-0xabc-5-ADD").unwrap(), stamped);
    }

    #[test]
    fn test_update_with_self_is_identity() {
        let map = BugMap::new();
        map.cover_bug("ETHERLEAKING-0xabc");
        let other = BugMap::new();
        other.update(&map);
        assert!(!map.update(&other));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_results_format() {
        let map = BugMap::new();
        map.cover_bug("BLOCKDEPENDENCY-0xabc-17-LT");
        let results = map.results();
        assert_eq!(results.len(), 1);
        assert!(results[0].starts_with("BLOCKDEPENDENCY-0xabc-17-LT-"));
    }
}
