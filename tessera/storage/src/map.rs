//! The ordered map abstraction and a lazy cursor over it.

use std::ops::Bound;
use std::sync::Arc;

/// An ordered, concurrently accessible map.
///
/// Implementations must allow `get`, `put`, `remove` and `next_entry` to be
/// called from many threads at once. Conditional updates are not part of the
/// contract: callers that need compare-and-swap semantics serialize writers
/// for a key themselves and then `put` unconditionally.
pub trait StorageMap<K, V>: Send + Sync {
    /// Name the map was opened under.
    fn name(&self) -> &str;

    fn get(&self, key: &K) -> Option<V>;

    /// Replace the value for `key` unconditionally.
    fn put(&self, key: K, value: V);

    fn remove(&self, key: &K) -> Option<V>;

    /// Returns the first entry whose key lies within `from` (lower bound).
    fn next_entry(&self, from: Bound<&K>) -> Option<(K, V)>;

    /// Returns the largest key currently stored.
    fn last_key(&self) -> Option<K>;

    fn size(&self) -> usize;

    fn clear(&self);

    fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Lazy, ordered iteration over a [`StorageMap`].
///
/// The cursor only remembers the last key it returned, so it tolerates
/// concurrent modification and can be repositioned at any key with
/// [`Cursor::seek`].
pub struct Cursor<K, V> {
    map: Arc<dyn StorageMap<K, V>>,
    next: Bound<K>,
}

impl<K, V> Cursor<K, V> {
    /// Creates a cursor starting at `from` (inclusive), or at the first key.
    pub fn new(map: Arc<dyn StorageMap<K, V>>, from: Option<K>) -> Self {
        let next = match from {
            Some(key) => Bound::Included(key),
            None => Bound::Unbounded,
        };
        Self { map, next }
    }

    /// Restart the iteration at `key` (inclusive).
    pub fn seek(&mut self, key: K) {
        self.next = Bound::Included(key);
    }
}

impl<K: Clone, V> Iterator for Cursor<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self.map.next_entry(self.next.as_ref())?;
        self.next = Bound::Excluded(key.clone());
        Some((key, value))
    }
}
