//! Keyed TTL cache.
//!
//! Entries live for a fixed TTL. Concurrent misses on the same cache are
//! serialized by a population lock: check, lock, re-check, populate. Only one
//! caller computes a missing value while the others wait and then read it.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex;

struct Entry<V> {
    value: V,
    inserted: Instant,
}

/// A TTL cache with bounded capacity.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    populate: Mutex<()>,
    ttl: Duration,
    max_entries: usize,
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("len", &self.entries.read().len())
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            populate: Mutex::new(()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Returns a live entry.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|e| e.inserted.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    /// Inserts an entry, evicting expired entries and then the oldest when full.
    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write();
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, e| e.inserted.elapsed() < ttl);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    /// Returns the cached value or computes, stores and returns it.
    ///
    /// Errors from `fill` are returned and nothing is cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, fill: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }
        let _guard = self.populate.lock().await;
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }
        let value = fill().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Removes every entry matching the predicate.
    pub fn invalidate_where<P>(&self, predicate: P)
    where
        P: Fn(&K) -> bool,
    {
        self.entries.write().retain(|k, _| !predicate(k));
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Returns the number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_insert_and_get() {
        let cache = TtlCache::new(Duration::from_secs(60), 10);
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn test_expiry() {
        let cache = TtlCache::new(Duration::from_millis(0), 10);
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert(1, "one");
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(2, "two");
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(3, "three");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&3), Some("three"));
    }

    #[test]
    fn test_invalidate_where() {
        let cache = TtlCache::new(Duration::from_secs(60), 10);
        cache.insert(("Patient", 1), 1);
        cache.insert(("Patient", 2), 2);
        cache.insert(("Observation", 1), 3);
        cache.invalidate_where(|k| k.0 == "Patient");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_single_fill_under_contention() {
        let cache = Arc::new(TtlCache::new(Duration::from_secs(60), 10));
        let fills = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fills = fills.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_insert_with("k", || async {
                        fills.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok::<_, ()>(42)
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(42));
        }
        assert_eq!(fills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_not_cached() {
        let cache: TtlCache<&str, i32> = TtlCache::new(Duration::from_secs(60), 10);
        let result = cache
            .get_or_try_insert_with("k", || async { Err::<i32, _>("boom") })
            .await;
        assert_eq!(result, Err("boom"));
        assert!(cache.is_empty());
    }
}
