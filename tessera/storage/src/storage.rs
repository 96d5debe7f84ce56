use std::sync::Arc;

use crate::error::StorageResult;
use crate::map::StorageMap;

/// A named collection of [`StorageMap`]s.
pub trait Storage: Send + Sync {
    /// Open (or create) the map called `name`.
    ///
    /// Opening an existing map with different key or value types fails with
    /// [`StorageError::TypeMismatch`](crate::StorageError::TypeMismatch).
    fn open_map<K, V>(&self, name: &str) -> StorageResult<Arc<dyn StorageMap<K, V>>>
    where
        K: Ord + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static;

    fn has_map(&self, name: &str) -> bool;

    /// Drop the map called `name`, returning whether it existed.
    fn remove_map(&self, name: &str) -> bool;

    fn map_names(&self) -> Vec<String>;
}
