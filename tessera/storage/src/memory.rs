use std::any::{Any, type_name};
use std::ops::Bound;
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;

use crate::error::{StorageError, StorageResult};
use crate::map::StorageMap;
use crate::storage::Storage;

/// An in-memory ordered map backed by a lock-free skip list.
pub struct MemoryMap<K, V> {
    name: String,
    entries: SkipMap<K, V>,
}

impl<K, V> MemoryMap<K, V>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: SkipMap::new(),
        }
    }
}

impl<K, V> StorageMap<K, V> for MemoryMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn put(&self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value().clone())
    }

    fn next_entry(&self, from: Bound<&K>) -> Option<(K, V)> {
        self.entries
            .lower_bound(from)
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    fn last_key(&self) -> Option<K> {
        self.entries.back().map(|e| e.key().clone())
    }

    fn size(&self) -> usize {
        self.entries.len()
    }

    fn clear(&self) {
        self.entries.clear();
    }
}

struct OpenMap {
    map: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// A [`Storage`] keeping every map in memory.
#[derive(Default)]
pub struct MemoryStorage {
    maps: DashMap<String, OpenMap>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn open_map<K, V>(&self, name: &str) -> StorageResult<Arc<dyn StorageMap<K, V>>>
    where
        K: Ord + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(StorageError::InvalidMapName(name.to_string()));
        }
        let requested = type_name::<MemoryMap<K, V>>();
        let (map, existing) = {
            let entry = self
                .maps
                .entry(name.to_string())
                .or_insert_with(|| OpenMap {
                    map: Arc::new(MemoryMap::<K, V>::new(name)),
                    type_name: requested,
                });
            (entry.map.clone(), entry.type_name)
        };
        match map.downcast::<MemoryMap<K, V>>() {
            Ok(map) => Ok(map as Arc<dyn StorageMap<K, V>>),
            Err(_) => Err(StorageError::TypeMismatch {
                name: name.to_string(),
                existing,
                requested,
            }),
        }
    }

    fn has_map(&self, name: &str) -> bool {
        self.maps.contains_key(name)
    }

    fn remove_map(&self, name: &str) -> bool {
        self.maps.remove(name).is_some()
    }

    fn map_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.maps.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
