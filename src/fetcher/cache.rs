//! TTL-bounded LRU response cache, keyed by the full request URL with an
//! endpoint-specific prefix.

use std::time::{Duration, Instant};

use lru::LruCache;
use std::num::NonZeroUsize;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct TtlLruCache<V: Clone> {
    inner: LruCache<String, Entry<V>>,
    ttl: Duration,
}

impl<V: Clone> TtlLruCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: LruCache::new(capacity),
            ttl,
        }
    }

    /// Returns the cached value if present and not expired. An expired
    /// entry is evicted on access.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let expired = match self.inner.peek(key) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.inner.pop(key);
            return None;
        }
        self.inner.get(key).map(|e| e.value.clone())
    }

    pub fn put(&mut self, key: String, value: V) {
        self.inner.put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_not_returned() {
        let mut cache: TtlLruCache<i32> = TtlLruCache::new(10, Duration::from_millis(1));
        cache.put("k".to_string(), 42);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn fresh_entries_round_trip() {
        let mut cache: TtlLruCache<i32> = TtlLruCache::new(10, Duration::from_secs(60));
        cache.put("k".to_string(), 7);
        assert_eq!(cache.get("k"), Some(7));
    }

    #[test]
    fn respects_capacity_lru_eviction() {
        let mut cache: TtlLruCache<i32> = TtlLruCache::new(2, Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        cache.put("c".to_string(), 3);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }
}
