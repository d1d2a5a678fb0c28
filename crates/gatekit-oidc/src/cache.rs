//! Bounded TTL cache for remote lookup results.
//!
//! One generic cache backs four consumers: the dynamic key resolver's
//! key-by-identifier cache, the token introspection cache, the UserInfo
//! cache, and the back-channel logout token cache. Entries expire after a
//! fixed TTL, swept by an optional periodic task and lazily on access.
//!
//! Capacity is enforced with an atomic pre-increment admission check. When
//! admission fails the *entire* cache is cleared — capacity pressure resets
//! the cache instead of evicting per entry. This mirrors the original
//! system's behavior and is intentionally not LRU (see DESIGN.md).
//!
//! The map is safe for uncoordinated concurrent reads and writes; a sweep
//! only removes entries it observes as already expired.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// A cached value with its creation timestamp.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created: Instant,
}

/// Generic TTL + capacity bounded cache.
pub struct ResultCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    entries: DashMap<K, CacheEntry<V>>,
    size: AtomicUsize,
    max_size: usize,
    ttl: Duration,
}

impl<K, V> ResultCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache bounded to `max_size` entries, each entry expiring
    /// `ttl` after insertion.
    #[must_use]
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            size: AtomicUsize::new(0),
            max_size,
            ttl,
        }
    }

    /// Looks up a value. Expired entries are treated as misses and removed
    /// on access, whether or not the periodic sweep has run.
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                if entry.created.elapsed() < self.ttl {
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };

        if expired && self.entries.remove(key).is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        None
    }

    /// Returns `true` if a non-expired entry exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts a value, admitting it against the capacity bound.
    ///
    /// Admission pre-increments the size counter with a CAS loop capped at
    /// `max_size`. A full cache is cleared wholesale and the offending
    /// entry is dropped — the insert that hits the bound leaves the cache
    /// empty, not one entry deep.
    pub fn insert(&self, key: K, value: V) {
        if self.max_size == 0 {
            return;
        }

        loop {
            let current = self.size.load(Ordering::Acquire);
            if current >= self.max_size {
                tracing::debug!(
                    "Result cache reached capacity ({}), clearing all entries",
                    self.max_size
                );
                self.clear();
                return;
            }
            if self
                .size
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let replaced = self.entries.insert(
            key,
            CacheEntry {
                value,
                created: Instant::now(),
            },
        );
        if replaced.is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Removes and returns a non-expired value.
    ///
    /// The back-channel logout cache uses this for consumption semantics: a
    /// logout token matched against an active session is removed so it
    /// cannot be replayed.
    pub fn remove(&self, key: &K) -> Option<V> {
        let (_, entry) = self.entries.remove(key)?;
        self.size.fetch_sub(1, Ordering::AcqRel);
        if entry.created.elapsed() < self.ttl {
            Some(entry.value)
        } else {
            None
        }
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.clear();
        self.size.store(0, Ordering::Release);
    }

    /// Removes every entry whose age has reached the TTL.
    pub fn cleanup(&self) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.created.elapsed() < ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.size.fetch_sub(removed, Ordering::AcqRel);
            tracing::debug!("Swept {} expired result cache entries", removed);
        }
    }

    /// Returns the number of stored entries, including not-yet-swept
    /// expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawns the periodic sweep task. The task runs until the returned
    /// handle is aborted or the runtime shuts down.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cache.cleanup();
            }
        })
    }

    #[cfg(test)]
    fn insert_with_age(&self, key: K, value: V, age: Duration) {
        self.insert(key.clone(), value);
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.created = Instant::now() - age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_before_ttl_miss_after() {
        let cache: ResultCache<String, u32> = ResultCache::new(10, Duration::from_millis(500));

        cache.insert("fresh".to_string(), 1);
        cache.insert_with_age("stale".to_string(), 2, Duration::from_millis(500));
        cache.insert_with_age("older".to_string(), 3, Duration::from_secs(2));

        assert_eq!(cache.get(&"fresh".to_string()), Some(1));
        // Entries at exactly ttl and beyond are misses even without a sweep.
        assert_eq!(cache.get(&"stale".to_string()), None);
        assert_eq!(cache.get(&"older".to_string()), None);

        // The lazy miss also removed them.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_pressure_clears_everything() {
        let cache: ResultCache<u32, u32> = ResultCache::new(3, Duration::from_secs(60));

        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(3, 3);
        assert_eq!(cache.len(), 3);

        // The (max+1)-th insert leaves the cache fully empty: whole-cache
        // clear, no partial eviction, no self-admission.
        cache.insert(4, 4);
        assert!(cache.is_empty());
        assert_eq!(cache.get(&4), None);
        assert_eq!(cache.get(&1), None);

        // The cache works normally again afterwards.
        cache.insert(5, 5);
        assert_eq!(cache.get(&5), Some(5));
    }

    #[test]
    fn test_replacing_key_does_not_leak_capacity() {
        let cache: ResultCache<u32, u32> = ResultCache::new(2, Duration::from_secs(60));

        cache.insert(1, 10);
        cache.insert(1, 11);
        cache.insert(1, 12);
        cache.insert(2, 20);

        // Three replacements of the same key consumed one slot.
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some(12));
        assert_eq!(cache.get(&2), Some(20));
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache: ResultCache<u32, u32> = ResultCache::new(0, Duration::from_secs(60));
        cache.insert(1, 1);
        assert!(cache.is_empty());
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_remove_consumes_entry() {
        let cache: ResultCache<String, String> = ResultCache::new(10, Duration::from_secs(60));

        cache.insert("logout-token".to_string(), "verified".to_string());
        assert!(cache.contains(&"logout-token".to_string()));

        assert_eq!(
            cache.remove(&"logout-token".to_string()),
            Some("verified".to_string())
        );

        // Consumed: a replayed lookup finds nothing.
        assert!(!cache.contains(&"logout-token".to_string()));
        assert_eq!(cache.remove(&"logout-token".to_string()), None);
    }

    #[test]
    fn test_cleanup_removes_only_expired() {
        let cache: ResultCache<u32, u32> = ResultCache::new(10, Duration::from_millis(500));

        cache.insert(1, 1);
        cache.insert_with_age(2, 2, Duration::from_secs(1));
        cache.insert_with_age(3, 3, Duration::from_secs(1));

        cache.cleanup();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1), Some(1));
    }

    #[tokio::test]
    async fn test_sweeper_task_runs() {
        let cache: Arc<ResultCache<u32, u32>> =
            Arc::new(ResultCache::new(10, Duration::from_millis(5)));
        cache.insert(1, 1);

        let handle = cache.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(cache.is_empty());
    }
}
