//! Small key-value caches with a disabled variant.
//!
//! Callers hold a `Box<dyn Cache<K, V>>` picked once by [`new_cache`]; a
//! capacity of zero yields [`NoopCache`], so call sites never branch on
//! whether caching is enabled.

use lru::LruCache;
use std::hash::Hash;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub trait Cache<K, V>: Send + Sync {
    /// Look up `key`, marking it recently used.
    fn get(&self, key: &K) -> Option<V>;

    fn add(&self, key: K, value: V);

    fn remove(&self, key: &K);

    fn contains(&self, key: &K) -> bool;

    /// Look up `key` without touching its recency.
    fn peek(&self, key: &K) -> Option<V>;

    /// Snapshot of the cached keys, most recently used first.
    fn keys(&self) -> Vec<K>;
}

/// Build a cache holding at most `capacity` entries, or a [`NoopCache`]
/// when `capacity` is zero.
pub fn new_cache<K, V>(capacity: usize) -> Box<dyn Cache<K, V>>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    match NonZeroUsize::new(capacity) {
        Some(capacity) => Box::new(BoundedCache::new(capacity)),
        None => Box::new(NoopCache::default()),
    }
}

/// Least-recently-used cache with a fixed capacity.
pub struct BoundedCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V> BoundedCache<K, V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> Cache<K, V> for BoundedCache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    fn add(&self, key: K, value: V) {
        self.lock().put(key, value);
    }

    fn remove(&self, key: &K) {
        self.lock().pop(key);
    }

    fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    fn peek(&self, key: &K) -> Option<V> {
        self.lock().peek(key).cloned()
    }

    fn keys(&self) -> Vec<K> {
        self.lock().iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Stores nothing. Used when caching is disabled.
pub struct NoopCache<K, V> {
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Default for NoopCache<K, V> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K, V> Cache<K, V> for NoopCache<K, V> {
    fn get(&self, _key: &K) -> Option<V> {
        None
    }

    fn add(&self, _key: K, _value: V) {}

    fn remove(&self, _key: &K) {}

    fn contains(&self, _key: &K) -> bool {
        false
    }

    fn peek(&self, _key: &K) -> Option<V> {
        None
    }

    fn keys(&self) -> Vec<K> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bounded(capacity: usize) -> BoundedCache<u32, String> {
        BoundedCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn add_get_remove() {
        let cache = bounded(4);
        cache.add(1, "one".into());
        assert!(cache.contains(&1));
        assert_eq!(cache.get(&1), Some("one".to_string()));
        cache.remove(&1);
        assert!(!cache.contains(&1));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = bounded(2);
        cache.add(1, "a".into());
        cache.add(2, "b".into());
        cache.get(&1);
        cache.add(3, "c".into());
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert_eq!(cache.keys(), vec![3, 1]);
    }

    #[test]
    fn peek_does_not_promote() {
        let cache = bounded(2);
        cache.add(1, "a".into());
        cache.add(2, "b".into());
        assert_eq!(cache.peek(&1), Some("a".to_string()));
        cache.add(3, "c".into());
        assert!(!cache.contains(&1));
    }

    #[test]
    fn zero_capacity_selects_noop() {
        let cache = new_cache::<u32, String>(0);
        cache.add(1, "one".into());
        assert!(!cache.contains(&1));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.peek(&1), None);
        assert!(cache.keys().is_empty());
    }

    proptest! {
        #[test]
        fn bounded_cache_contract(key in any::<u32>(), value in ".{0,16}") {
            let cache = new_cache::<u32, String>(8);
            cache.add(key, value.clone());
            prop_assert!(cache.contains(&key));
            prop_assert_eq!(cache.get(&key), Some(value));
            cache.remove(&key);
            prop_assert!(!cache.contains(&key));
            prop_assert_eq!(cache.get(&key), None);
        }

        #[test]
        fn noop_cache_never_returns(key in any::<u32>(), value in any::<u64>()) {
            let cache = NoopCache::<u32, u64>::default();
            cache.add(key, value);
            prop_assert!(!cache.contains(&key));
            prop_assert_eq!(cache.get(&key), None);
            prop_assert_eq!(cache.peek(&key), None);
        }

        #[test]
        fn bounded_cache_never_exceeds_capacity(keys in prop::collection::vec(any::<u32>(), 0..64)) {
            let cache = bounded(8);
            for k in keys {
                cache.add(k, k.to_string());
            }
            prop_assert!(cache.keys().len() <= 8);
        }
    }
}
