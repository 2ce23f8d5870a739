//! Reconcile result cache.
//!
//! Keyed by the namespaced object key, qualified by the spec fingerprint and
//! the observed phase. Bounded, oldest-evicted, entries stale after the TTL.
//! Single-owner under a reader/writer lock.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use mano_core::types::VnfPhase;

use crate::controller::ReconcileResult;

pub const DEFAULT_CACHE_CAPACITY: usize = 500;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: u64,
    /// Phase the result was computed in. A hit requires the phase to match so
    /// a cached Pending result cannot mask progression to Creating.
    pub phase: Option<VnfPhase>,
    pub result: ReconcileResult,
    pub error: Option<String>,
    pub timestamp: Instant,
}

pub struct ReconcileCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
}

impl Default for ReconcileCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

impl ReconcileCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            ttl,
        }
    }

    /// Fresh entry for `key` matching fingerprint and phase, or a miss.
    pub fn get(
        &self,
        key: &str,
        fingerprint: u64,
        phase: Option<VnfPhase>,
    ) -> Option<CacheEntry> {
        let entries = self.entries.read().expect("cache lock poisoned");
        let entry = entries.get(key)?;
        if entry.timestamp.elapsed() > self.ttl {
            return None;
        }
        if entry.fingerprint != fingerprint || entry.phase != phase {
            return None;
        }
        Some(entry.clone())
    }

    pub fn insert(
        &self,
        key: &str,
        fingerprint: u64,
        phase: Option<VnfPhase>,
        result: ReconcileResult,
        error: Option<String>,
    ) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            // evict the oldest entry
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.timestamp)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                fingerprint,
                phase,
                result,
                error,
                timestamp: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.write().expect("cache lock poisoned").remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> ReconcileResult {
        ReconcileResult::after(Duration::from_secs(60))
    }

    #[test]
    fn fresh_matching_entry_hits() {
        let cache = ReconcileCache::default();
        cache.insert("slices/a", 42, Some(VnfPhase::Running), result(), None);
        assert!(cache.get("slices/a", 42, Some(VnfPhase::Running)).is_some());
    }

    #[test]
    fn fingerprint_or_phase_mismatch_misses() {
        let cache = ReconcileCache::default();
        cache.insert("slices/a", 42, Some(VnfPhase::Pending), result(), None);
        assert!(cache.get("slices/a", 43, Some(VnfPhase::Pending)).is_none());
        assert!(cache.get("slices/a", 42, Some(VnfPhase::Creating)).is_none());
    }

    #[test]
    fn stale_entries_miss() {
        let cache = ReconcileCache::new(10, Duration::from_millis(0));
        cache.insert("slices/a", 42, None, result(), None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("slices/a", 42, None).is_none());
    }

    #[test]
    fn insert_overflow_evicts_oldest() {
        let cache = ReconcileCache::new(2, Duration::from_secs(300));
        cache.insert("slices/a", 1, None, result(), None);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("slices/b", 2, None, result(), None);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("slices/c", 3, None, result(), None);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("slices/a", 1, None).is_none());
        assert!(cache.get("slices/b", 2, None).is_some());
        assert!(cache.get("slices/c", 3, None).is_some());
    }

    #[test]
    fn removal_clears_the_key() {
        let cache = ReconcileCache::default();
        cache.insert("slices/a", 42, None, result(), None);
        cache.remove("slices/a");
        assert!(cache.get("slices/a", 42, None).is_none());
        assert!(cache.is_empty());
    }
}
