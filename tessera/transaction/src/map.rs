//! Transactional maps
//!
//! A [`TransactionMap`] is one transaction's view of a named storage map. The
//! storage map `name` holds the head generation of every key and
//! `name.versions` holds the generations themselves, each linking to the one
//! it replaced. Readers walk that chain and never block; writers swap the
//! head under a striped key lock after checking it is still the one they
//! expect.

use std::any::{Any, type_name};
use std::collections::HashSet;
use std::fmt;
use std::hash::{BuildHasher, Hash, RandomState};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tessera_storage::{Cursor, Storage, StorageMap};

use crate::error::{IdError, TransactionError, TxnResult};
use crate::listener::Listener;
use crate::manager::TransactionEngine;
use crate::transaction::{ReadView, Transaction, TxnState};
use crate::txn_id::TransactionId;
use crate::undo::{UndoLogRecord, UndoTarget};
use crate::version::{Generation, VersionedEntry};

pub trait MapKey: Ord + Clone + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> MapKey for T where T: Ord + Clone + Hash + fmt::Debug + Send + Sync + 'static {}

pub trait MapValue: Clone + Send + Sync + 'static {}

impl<T> MapValue for T where T: Clone + Send + Sync + 'static {}

/// Suffix of the storage map holding a map's generations.
pub const VERSIONS_SUFFIX: &str = ".versions";

/// Storage shared by every transaction's view of one map.
pub(crate) struct MapStore<K, V> {
    name: String,
    heads: Arc<dyn StorageMap<K, Generation>>,
    versions: Arc<dyn StorageMap<Generation, Arc<VersionedEntry<V>>>>,
    next_generation: AtomicU64,
    stripes: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl<K: MapKey, V: MapValue> MapStore<K, V> {
    /// Open the storage maps behind `name`. Also returns the largest
    /// transaction id found among the stored generations.
    pub(crate) fn open<S: Storage>(
        name: &str,
        storage: &S,
        stripes: usize,
    ) -> TxnResult<(Self, TransactionId)> {
        let heads = storage.open_map::<K, Generation>(name)?;
        let versions =
            storage.open_map::<Generation, Arc<VersionedEntry<V>>>(&format!("{name}{VERSIONS_SUFFIX}"))?;

        let next_generation = versions.last_key().map_or(1, |g| g.raw() + 1);
        let max_id = Cursor::new(versions.clone(), None)
            .map(|(_, entry)| entry.transaction_id())
            .max()
            .unwrap_or(TransactionId::COMMITTED);

        let store = Self {
            name: name.to_string(),
            heads,
            versions,
            next_generation: AtomicU64::new(next_generation),
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        };
        Ok((store, max_id))
    }

    fn lock(&self, key: &K) -> MutexGuard<'_, ()> {
        let index = self.hasher.hash_one(key) as usize % self.stripes.len();
        self.stripes[index].lock()
    }

    fn head(&self, key: &K) -> Option<Generation> {
        self.heads.get(key)
    }

    fn entry(&self, generation: Generation) -> Option<Arc<VersionedEntry<V>>> {
        self.versions.get(&generation)
    }

    /// Link `entry` in as the new head of `key`. Caller holds the key's stripe.
    fn install(&self, key: K, entry: VersionedEntry<V>) -> TxnResult<Generation> {
        let raw = self.next_generation.fetch_add(1, Ordering::SeqCst);
        if raw == u64::MAX {
            return Err(IdError::GenerationOverflow(raw).into());
        }
        let generation = Generation::new(raw);
        self.versions.put(generation, Arc::new(entry));
        self.heads.put(key, generation);
        Ok(generation)
    }

    /// Unlink the generations `unfinished` transactions of an earlier run left
    /// at the head of a chain. Returns how many were removed.
    pub(crate) fn discard_unfinished(&self, unfinished: &HashSet<TransactionId>) -> usize {
        if unfinished.is_empty() {
            return 0;
        }
        let mut discarded = 0;
        for (key, _) in Cursor::new(self.heads.clone(), None) {
            let _guard = self.lock(&key);
            let original = self.head(&key);
            let mut head = original;
            while let Some(generation) = head {
                let Some(entry) = self.entry(generation) else {
                    break;
                };
                if !unfinished.contains(&entry.transaction_id()) {
                    break;
                }
                self.versions.remove(&generation);
                discarded += 1;
                head = entry.previous();
            }
            if head != original {
                match head {
                    Some(generation) => self.heads.put(key, generation),
                    None => {
                        self.heads.remove(&key);
                    }
                }
            }
        }
        discarded
    }

    /// Drop generations below the oldest one any open or future transaction
    /// can still see.
    fn prune(&self, engine: &TransactionEngine, watermark: TransactionId) -> usize {
        let mut pruned = 0;
        for (key, _) in Cursor::new(self.heads.clone(), None) {
            let _guard = self.lock(&key);
            let Some(head) = self.head(&key) else {
                continue;
            };

            // Step 1: Find the newest generation every reader agrees on.
            let mut generation = head;
            let mut cutoff = None;
            while let Some(entry) = self.entry(generation) {
                let writer = entry.transaction_id();
                if writer < watermark && engine.is_committed(writer) {
                    cutoff = Some((generation, entry));
                    break;
                }
                match entry.previous() {
                    Some(previous) => generation = previous,
                    None => break,
                }
            }
            let Some((cutoff, entry)) = cutoff else {
                continue;
            };

            // Step 2: Collect everything older.
            let mut older = Vec::new();
            let mut next = entry.previous();
            while let Some(generation) = next {
                older.push(generation);
                next = self.entry(generation).and_then(|e| e.previous());
            }

            // Step 3: A deleted key nobody can see past disappears entirely.
            if cutoff == head && entry.is_tombstone() {
                self.heads.remove(&key);
                self.versions.remove(&cutoff);
                pruned += 1;
            } else if !older.is_empty() {
                self.versions.put(cutoff, Arc::new(entry.detached()));
            }
            for generation in older {
                self.versions.remove(&generation);
                pruned += 1;
            }
        }
        if pruned > 0 {
            tracing::debug!("pruned {} generations from map {}", pruned, self.name);
        }
        pruned
    }
}

impl<K: MapKey, V: MapValue> UndoTarget for MapStore<K, V> {
    fn map_name(&self) -> &str {
        &self.name
    }

    fn undo(&self, key: &(dyn Any + Send + Sync), previous: Option<Generation>, written: Generation) {
        let Some(key) = key.downcast_ref::<K>() else {
            tracing::warn!("undo record for map {} carries a foreign key type", self.name);
            return;
        };
        let _guard = self.lock(key);
        if self.head(key) == Some(written) {
            match previous {
                Some(previous) => self.heads.put(key.clone(), previous),
                None => {
                    self.heads.remove(key);
                }
            }
        }
        self.versions.remove(&written);
    }
}

/// Type-erased access the engine needs for checkpoints.
pub(crate) trait VersionPruner: Send + Sync {
    fn prune(&self, engine: &TransactionEngine, watermark: TransactionId) -> usize;
}

impl<K: MapKey, V: MapValue> VersionPruner for MapStore<K, V> {
    fn prune(&self, engine: &TransactionEngine, watermark: TransactionId) -> usize {
        MapStore::prune(self, engine, watermark)
    }
}

enum AddOutcome {
    Added,
    Duplicate,
    Blocked(Arc<TxnState>),
}

/// One transaction's view of a named map.
pub struct TransactionMap<K, V> {
    store: Arc<MapStore<K, V>>,
    transaction: Arc<Transaction>,
}

impl<K, V> Clone for TransactionMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transaction: self.transaction.clone(),
        }
    }
}

impl<K: MapKey, V: MapValue> TransactionMap<K, V> {
    pub(crate) fn new(store: Arc<MapStore<K, V>>, transaction: Arc<Transaction>) -> Self {
        Self { store, transaction }
    }

    pub fn name(&self) -> &str {
        &self.store.name
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    /// The same map seen by another transaction.
    pub fn get_instance(&self, transaction: &Arc<Transaction>) -> Self {
        Self::new(self.store.clone(), transaction.clone())
    }

    // ---- Reads ----

    /// The value of `key` visible to this transaction.
    pub fn get(&self, key: &K) -> TxnResult<Option<V>> {
        let view = self.transaction.read_view();
        Ok(self.visible_value(&view, key))
    }

    pub fn contains_key(&self, key: &K) -> TxnResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// The visible value of `key` together with the generation it was read
    /// from, which is what a following [`try_update`](Self::try_update)
    /// expects. The write only succeeds while that generation is still the head.
    pub fn get_value_and_ref(&self, key: &K) -> TxnResult<(Option<V>, Option<Generation>)> {
        let view = self.transaction.read_view();
        Ok(match self.visible_entry(&view, key) {
            Some((generation, entry)) => (entry.value().cloned(), Some(generation)),
            None => (None, None),
        })
    }

    /// The raw head generation of `key`, whoever wrote it.
    pub fn transactional_value(&self, key: &K) -> Option<(Generation, Arc<VersionedEntry<V>>)> {
        loop {
            let generation = self.store.head(key)?;
            if let Some(entry) = self.store.entry(generation) {
                return Some((generation, entry));
            }
        }
    }

    /// Number of keys with a head generation, uncommitted and deleted ones included.
    pub fn raw_size(&self) -> usize {
        self.store.heads.size()
    }

    /// Number of keys visible to this transaction.
    pub fn size(&self) -> usize {
        self.entry_iterator(None).count()
    }

    /// Entries visible to this transaction in key order, starting at `from`.
    pub fn entry_iterator(&self, from: Option<K>) -> EntryIter<K, V> {
        EntryIter {
            view: self.transaction.read_view(),
            cursor: Cursor::new(self.store.heads.clone(), from),
            map: self.clone(),
        }
    }

    /// Keys visible to this transaction in key order, starting at `from`.
    /// With `include_uncommitted`, keys other transactions are writing right
    /// now are reported too.
    pub fn key_iterator(&self, from: Option<K>, include_uncommitted: bool) -> KeyIter<K, V> {
        KeyIter {
            view: self.transaction.read_view(),
            cursor: Cursor::new(self.store.heads.clone(), from),
            map: self.clone(),
            include_uncommitted,
        }
    }

    fn visible_value(&self, view: &ReadView, key: &K) -> Option<V> {
        self.visible_entry(view, key)
            .and_then(|(_, entry)| entry.value().cloned())
    }

    /// The newest generation of `key` `view` may see. Tombstones are returned
    /// as they are.
    fn visible_entry(
        &self,
        view: &ReadView,
        key: &K,
    ) -> Option<(Generation, Arc<VersionedEntry<V>>)> {
        let engine = self.transaction.engine();
        'restart: loop {
            let mut generation = self.store.head(key)?;
            loop {
                let Some(entry) = self.store.entry(generation) else {
                    // Rolled back under our feet.
                    continue 'restart;
                };
                let writer = entry.transaction_id();
                if view.is_visible(writer, engine) {
                    // A writer that looked committed may have been a rollback
                    // finishing; its generation is gone by then.
                    if writer != view.id() && self.store.entry(generation).is_none() {
                        continue 'restart;
                    }
                    return Some((generation, entry));
                }
                generation = entry.previous()?;
            }
        }
    }

    // ---- Writes ----

    /// Replace the value of `key` if its head is still `expected` and no
    /// other transaction holds it. Returns `false` on conflict.
    pub fn try_update(
        &self,
        key: K,
        value: V,
        columns: Option<&[usize]>,
        expected: Option<Generation>,
    ) -> TxnResult<bool> {
        self.write(key, Some(value), columns, expected)
    }

    /// Delete `key` if its head is still `expected`. Removing a key that has
    /// no generation at all succeeds without writing anything.
    pub fn try_remove(&self, key: K, expected: Option<Generation>) -> TxnResult<bool> {
        if expected.is_none() && self.store.head(&key).is_none() {
            self.transaction.check_writable()?;
            return Ok(true);
        }
        self.write(key, None, None, expected)
    }

    /// Take the row lock of `key` by writing its current value again.
    /// Fails on a missing or deleted key.
    pub fn try_lock(&self, key: K, expected: Option<Generation>) -> TxnResult<bool> {
        let Some(generation) = expected else {
            self.transaction.check_writable()?;
            return Ok(false);
        };
        let Some(entry) = self.store.entry(generation) else {
            return Ok(false);
        };
        match entry.value() {
            Some(value) => self.write(key, Some(value.clone()), None, expected),
            None => Ok(false),
        }
    }

    /// Whether `generation` is held by another transaction still in flight
    /// and touches any of `columns`.
    pub fn is_locked(&self, generation: Generation, columns: Option<&[usize]>) -> bool {
        let Some(entry) = self.store.entry(generation) else {
            return false;
        };
        let writer = entry.transaction_id();
        writer != self.transaction.id()
            && !self.transaction.engine().is_committed(writer)
            && entry.overlaps(columns)
    }

    /// Write `value` for `key`, returning the value visible before.
    /// Fails with [`TransactionError::Locked`] on conflict.
    pub fn put(&self, key: K, value: V) -> TxnResult<Option<V>> {
        let (old, seen) = self.get_value_and_ref(&key)?;
        if self.try_update(key.clone(), value, None, seen)? {
            Ok(old)
        } else {
            Err(self.locked(&key))
        }
    }

    /// Delete `key`, returning the value visible before.
    /// Fails with [`TransactionError::Locked`] on conflict.
    pub fn remove(&self, key: &K) -> TxnResult<Option<V>> {
        let (old, seen) = self.get_value_and_ref(key)?;
        if old.is_none() {
            return Ok(None);
        }
        if self.try_remove(key.clone(), seen)? {
            Ok(old)
        } else {
            Err(self.locked(key))
        }
    }

    /// Delete every entry visible to this transaction.
    pub fn clear(&self) -> TxnResult<()> {
        self.transaction.check_writable()?;
        let keys: Vec<K> = self.key_iterator(None, false).collect();
        for key in keys {
            self.remove(&key)?;
        }
        Ok(())
    }

    /// Write `value` as already committed, outside any transaction's undo log.
    pub fn put_committed(&self, key: K, value: V) -> TxnResult<()> {
        let _guard = self.store.lock(&key);
        let head = self.store.head(&key);
        if let Some(generation) = head {
            let held = self
                .store
                .entry(generation)
                .is_some_and(|entry| !self.transaction.engine().is_committed(entry.transaction_id()));
            if held {
                return Err(self.locked(&key));
            }
        }
        self.store
            .install(key, VersionedEntry::new(Some(value), TransactionId::COMMITTED, head))?;
        Ok(())
    }

    /// Insert `value` unless `key` already has a live value.
    ///
    /// The outcome goes to `listener`. If another transaction is writing the
    /// key, the attempt is resumed once that transaction terminates, on the
    /// thread that terminates it.
    pub fn add_if_absent(&self, key: K, value: V, listener: Arc<dyn Listener>) -> TxnResult<()> {
        self.transaction.check_writable()?;
        listener.before_operation();
        self.resume_add(key, value, listener);
        Ok(())
    }

    fn resume_add(&self, key: K, value: V, listener: Arc<dyn Listener>) {
        loop {
            if let Err(e) = self.transaction.check_writable() {
                listener.set_exception(e);
                listener.operation_undo();
                return;
            }
            match self.attempt_add(&key, &value) {
                Ok(AddOutcome::Added) => {
                    listener.operation_complete();
                    return;
                }
                Ok(AddOutcome::Duplicate) => {
                    listener.set_exception(TransactionError::DuplicateKey {
                        map: self.name().to_string(),
                        key: format!("{key:?}"),
                    });
                    listener.operation_undo();
                    return;
                }
                Ok(AddOutcome::Blocked(writer)) => {
                    let map = self.clone();
                    let (k, v, l) = (key.clone(), value.clone(), listener.clone());
                    let waiter = Box::new(move || map.resume_add(k, v, l));
                    if writer.add_waiter(waiter).is_ok() {
                        tracing::debug!(
                            "transaction {} waits for {} to insert {:?}",
                            self.transaction.id(),
                            writer.id(),
                            key
                        );
                        return;
                    }
                    // The writer terminated in the meantime, look again.
                }
                Err(e) => {
                    listener.set_exception(e);
                    listener.operation_undo();
                    return;
                }
            }
        }
    }

    fn attempt_add(&self, key: &K, value: &V) -> TxnResult<AddOutcome> {
        self.transaction.log_first_write()?;
        let own = self.transaction.id();
        let _guard = self.store.lock(key);
        let head = self.store.head(key);
        if let Some(entry) = head.and_then(|g| self.store.entry(g)) {
            let writer = entry.transaction_id();
            if writer != own {
                if let Some(state) = self.transaction.engine().blocking_writer(writer) {
                    return Ok(AddOutcome::Blocked(state));
                }
            }
            if !entry.is_tombstone() {
                return Ok(AddOutcome::Duplicate);
            }
        }
        let written = self
            .store
            .install(key.clone(), VersionedEntry::new(Some(value.clone()), own, head))?;
        self.transaction.log_undo(UndoLogRecord::new(
            self.store.clone(),
            Box::new(key.clone()),
            head,
            written,
        ));
        Ok(AddOutcome::Added)
    }

    fn write(
        &self,
        key: K,
        value: Option<V>,
        columns: Option<&[usize]>,
        expected: Option<Generation>,
    ) -> TxnResult<bool> {
        self.transaction.check_writable()?;
        self.transaction.mark_touched();
        self.transaction.log_first_write()?;
        let own = self.transaction.id();

        let _guard = self.store.lock(&key);
        let head = self.store.head(&key);
        if head != expected {
            return Ok(false);
        }
        if let Some(generation) = head {
            let Some(entry) = self.store.entry(generation) else {
                return Ok(false);
            };
            let writer = entry.transaction_id();
            if writer != own && !self.transaction.engine().is_committed(writer) {
                return Ok(false);
            }
        }

        let entry = VersionedEntry::new(value, own, head).with_columns(columns);
        let written = self.store.install(key.clone(), entry)?;
        self.transaction.log_undo(UndoLogRecord::new(
            self.store.clone(),
            Box::new(key),
            head,
            written,
        ));
        Ok(true)
    }

    fn locked(&self, key: &K) -> TransactionError {
        TransactionError::Locked {
            map: self.name().to_string(),
            key: format!("{key:?}"),
        }
    }
}

impl<K, V> fmt::Debug for TransactionMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionMap")
            .field("name", &self.store.name)
            .field("transaction", &self.transaction.id())
            .finish()
    }
}

/// Lazy iterator over the entries a transaction can see.
pub struct EntryIter<K, V> {
    map: TransactionMap<K, V>,
    view: ReadView,
    cursor: Cursor<K, Generation>,
}

impl<K, V> EntryIter<K, V> {
    /// Continue the iteration at `key` (inclusive).
    pub fn seek(&mut self, key: K) {
        self.cursor.seek(key);
    }
}

impl<K: MapKey, V: MapValue> Iterator for EntryIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, _) = self.cursor.next()?;
            if let Some(value) = self.map.visible_value(&self.view, &key) {
                return Some((key, value));
            }
        }
    }
}

/// Lazy iterator over the keys a transaction can see.
pub struct KeyIter<K, V> {
    map: TransactionMap<K, V>,
    view: ReadView,
    cursor: Cursor<K, Generation>,
    include_uncommitted: bool,
}

impl<K, V> KeyIter<K, V> {
    /// Continue the iteration at `key` (inclusive).
    pub fn seek(&mut self, key: K) {
        self.cursor.seek(key);
    }
}

impl<K: MapKey, V: MapValue> KeyIter<K, V> {
    fn uncommitted_live(&self, head: Generation) -> bool {
        self.map.store.entry(head).is_some_and(|entry| {
            !entry.is_tombstone()
                && !self
                    .map
                    .transaction
                    .engine()
                    .is_committed(entry.transaction_id())
        })
    }
}

impl<K: MapKey, V: MapValue> Iterator for KeyIter<K, V> {
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, head) = self.cursor.next()?;
            if self.map.visible_value(&self.view, &key).is_some()
                || (self.include_uncommitted && self.uncommitted_live(head))
            {
                return Some(key);
            }
        }
    }
}

pub(crate) fn store_type_name<K: MapKey, V: MapValue>() -> &'static str {
    type_name::<MapStore<K, V>>()
}
