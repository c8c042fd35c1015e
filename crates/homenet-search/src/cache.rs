//! Search-result cache for paging.
//!
//! A search response may window a large result set; follow-up part
//! requests page through the cached set instead of re-running the query.
//! Entries live for 15 seconds, the cache holds at most 1000 entries with
//! LRU eviction, and any profile mutation clears it (the underlying set
//! may have changed).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default entry time-to-live.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

/// Default entry capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

struct Entry<T> {
    records: Arc<Vec<T>>,
    inserted_at: Instant,
    last_used_at: Instant,
}

/// An LRU + TTL cache of complete search result sets.
pub struct ResultCache<K, T> {
    entries: HashMap<K, Entry<T>>,
    capacity: usize,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone, T> ResultCache<K, T> {
    /// Create a cache with the documented defaults.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, DEFAULT_TTL)
    }

    /// Create a cache with explicit limits (for tests).
    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Store a result set, evicting the least-recently-used entry if the
    /// cache is full.
    pub fn insert(&mut self, key: K, records: Vec<T>) {
        let now = Instant::now();
        self.purge_expired(now);
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.evict_lru();
        }
        self.entries.insert(
            key,
            Entry {
                records: Arc::new(records),
                inserted_at: now,
                last_used_at: now,
            },
        );
    }

    /// Fetch a result set, refreshing its LRU position. Expired entries
    /// are treated as absent.
    pub fn get(&mut self, key: &K) -> Option<Arc<Vec<T>>> {
        let now = Instant::now();
        let ttl = self.ttl;
        match self.entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.inserted_at) <= ttl => {
                entry.last_used_at = now;
                Some(Arc::clone(&entry.records))
            }
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Drop every entry. Called on any profile mutation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.duration_since(e.inserted_at) <= ttl);
    }

    fn evict_lru(&mut self) {
        if let Some(key) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used_at)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&key);
        }
    }
}

impl<K: Hash + Eq + Clone, T> Default for ResultCache<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut cache: ResultCache<u64, u32> = ResultCache::new();
        cache.insert(1, vec![10, 20, 30]);
        let records = cache.get(&1).expect("cached");
        assert_eq!(records.as_slice(), &[10, 20, 30]);
    }

    #[test]
    fn test_miss() {
        let mut cache: ResultCache<u64, u32> = ResultCache::new();
        assert!(cache.get(&42).is_none());
    }

    #[test]
    fn test_expired_entry_is_absent() {
        let mut cache: ResultCache<u64, u32> =
            ResultCache::with_limits(10, Duration::from_millis(0));
        cache.insert(1, vec![1]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let mut cache: ResultCache<u64, u32> = ResultCache::with_limits(2, Duration::from_secs(60));
        cache.insert(1, vec![1]);
        cache.insert(2, vec![2]);
        // Touch 1 so 2 becomes the LRU entry.
        let _ = cache.get(&1);
        cache.insert(3, vec![3]);
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&2).is_none());
        assert!(cache.get(&3).is_some());
    }

    #[test]
    fn test_clear_on_mutation() {
        let mut cache: ResultCache<u64, u32> = ResultCache::new();
        cache.insert(1, vec![1]);
        cache.insert(2, vec![2]);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reinsert_replaces() {
        let mut cache: ResultCache<u64, u32> = ResultCache::with_limits(1, Duration::from_secs(60));
        cache.insert(1, vec![1]);
        cache.insert(1, vec![9]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1).expect("cached").as_slice(), &[9]);
    }
}
