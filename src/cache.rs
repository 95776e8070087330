//! Bounded in-memory caches
//!
//! Every component keeps its own caches (block hashes, raw events, decoded
//! blocks, owners, subgraphs). They all share one eviction policy:
//!
//! - entries are remembered in insertion order
//! - once the cache grows past its ceiling, the oldest chunk (about 10% of
//!   the ceiling) is dropped in one go
//!
//! This is deliberately not an LRU: reads never reorder entries.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

/// Insertion-ordered map with a size ceiling and chunked eviction.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    ceiling: usize,
    chunk: usize,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache that evicts 10% of `ceiling` once it is exceeded.
    pub fn new(ceiling: usize) -> Self {
        Self::with_chunk(ceiling, ceiling / 10)
    }

    /// Create a cache with an explicit eviction chunk size.
    pub fn with_chunk(ceiling: usize, chunk: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ceiling,
            chunk: chunk.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or overwrite an entry.
    ///
    /// Overwriting keeps the key's original position in the eviction order.
    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        if self.entries.len() > self.ceiling {
            self.evict_oldest();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) {
        for _ in 0..self.chunk {
            match self.order.pop_front() {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// A [`BoundedCache`] that can be shared between concurrent tasks.
///
/// The lock is only taken inside these methods, so it is never held across
/// an `.await` by callers.
#[derive(Debug)]
pub struct SharedCache<K, V> {
    inner: Mutex<BoundedCache<K, V>>,
}

impl<K, V> SharedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ceiling: usize) -> Self {
        Self {
            inner: Mutex::new(BoundedCache::new(ceiling)),
        }
    }

    pub fn with_chunk(ceiling: usize, chunk: usize) -> Self {
        Self {
            inner: Mutex::new(BoundedCache::with_chunk(ceiling, chunk)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.lock().insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoundedCache<K, V>> {
        // A panic while holding the lock cannot leave the map half-updated
        // in a way that matters for a cache, so keep using it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
