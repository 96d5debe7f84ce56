use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tessera_storage::{Storage, StorageError};

use crate::config::EngineConfig;
use crate::error::{TransactionError, TxnResult};
use crate::log::{
    TRANSACTION_LOG_MAP, TRANSACTION_META_MAP, TransactionLog, TransactionLogRecord,
};
use crate::map::{MapKey, MapStore, MapValue, VERSIONS_SUFFIX, VersionPruner, store_type_name};
use crate::transaction::{Snapshot, Transaction, TransactionStatus, TxnState};
use crate::txn_id::{TransactionId, TransactionIdGenerator};

/// Number of transaction ids reserved in the transaction log at a time.
const ID_RESERVATION_BLOCK: u64 = 1024;

struct ActiveTxn {
    state: Arc<TxnState>,
    handle: Weak<Transaction>,
}

struct RegisteredStore {
    store: Arc<dyn Any + Send + Sync>,
    pruner: Arc<dyn VersionPruner>,
    type_name: &'static str,
}

/// Outcome of [`TransactionEngine::checkpoint`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Number of generations removed from the version chains.
    pub pruned: usize,
    /// One [`TransactionError::StillOpen`] per transaction open for longer
    /// than the configured timeout, ordered by id.
    pub still_open: Vec<TransactionError>,
}

/// Process-wide registry of transactions.
///
/// The engine hands out transaction ids, tracks which transactions are still
/// open, owns the transaction log and resolves whatever a previous run left in
/// it when it is opened.
pub struct TransactionEngine {
    config: EngineConfig,
    id_generator: TransactionIdGenerator,
    /// Serializes id allocation with registration, so a transaction is
    /// registered before any later id is handed out. Holds the persisted
    /// id high-water mark.
    begin_lock: Mutex<u64>,
    /// Transactions that have not terminated yet, ordered by id.
    active_txns: SkipMap<TransactionId, ActiveTxn>,
    /// Map stores opened through this engine, by map name.
    stores: DashMap<String, RegisteredStore>,
    log: TransactionLog,
    /// Records completed by recovery when the engine was opened.
    recovered: Vec<TransactionLogRecord>,
    /// Transactions of an earlier run that wrote but never finished. Their
    /// generations are unlinked when a map is opened.
    unfinished: HashSet<TransactionId>,
    closed: AtomicBool,
}

impl TransactionEngine {
    /// Open the engine on `storage` and recover the transaction log.
    ///
    /// Every transaction the log shows as COMMITTING is completed forward and
    /// reported by [`recovered_transactions`](Self::recovered_transactions).
    /// Transactions the log still shows as OPEN died with the previous run and
    /// count as rolled back. A damaged log record aborts the open.
    pub fn open<S: Storage>(storage: &S, config: EngineConfig) -> TxnResult<Arc<Self>> {
        let log = TransactionLog::open(storage)?;
        let reserved = log.reserved_ids();
        let id_generator = TransactionIdGenerator::with_start(reserved);

        // Step 1: Read the whole log before touching anything.
        let records = log.read_all()?;

        // Step 2: Resolve every record forward.
        let mut recovered = Vec::new();
        let mut unfinished = HashSet::new();
        for record in records {
            id_generator.update_if_greater(record.id)?;
            match record.status {
                TransactionStatus::Committing => {
                    tracing::info!(
                        "recovered committing transaction {} with {} pending participants",
                        record.id,
                        record.pending_participants.len()
                    );
                    log.remove(record.id);
                    recovered.push(record);
                }
                // The record stays: maps opened by later runs still need it.
                TransactionStatus::Open => {
                    tracing::info!("transaction {} never finished, rolling it back", record.id);
                    unfinished.insert(record.id);
                }
                TransactionStatus::Closed => {
                    tracing::debug!("discarded finished transaction record {}", record.id);
                    log.remove(record.id);
                }
            }
        }
        if !recovered.is_empty() {
            tracing::info!("completed {} transactions during recovery", recovered.len());
        }

        Ok(Arc::new(Self {
            config,
            id_generator,
            begin_lock: Mutex::new(reserved),
            active_txns: SkipMap::new(),
            stores: DashMap::new(),
            log,
            recovered,
            unfinished,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// Begin a new transaction at the configured default isolation level.
    pub fn begin_transaction(self: &Arc<Self>, auto_commit: bool) -> TxnResult<Arc<Transaction>> {
        let mut reserved = self.begin_lock.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransactionError::IllegalState(
                "transaction engine is closed".to_string(),
            ));
        }
        let limit = self.config.max_open_transactions;
        if limit > 0 && self.active_txns.len() >= limit {
            return Err(TransactionError::TooManyOpenTransactions { limit });
        }

        let id = self.id_generator.next()?;
        if id.raw() >= *reserved {
            *reserved = id.raw().saturating_add(ID_RESERVATION_BLOCK);
            self.log.reserve_ids(*reserved);
        }
        let floor = self
            .active_txns
            .front()
            .map_or(id, |entry| *entry.key());
        let state = Arc::new(TxnState::new(id, floor));
        let txn = Arc::new(Transaction::new(
            self.clone(),
            state.clone(),
            auto_commit,
            self.config.default_isolation_level,
        ));
        self.active_txns.insert(
            id,
            ActiveTxn {
                state,
                handle: Arc::downgrade(&txn),
            },
        );
        tracing::debug!("began transaction {}", id);
        Ok(txn)
    }

    /// Stop accepting transactions and roll back the ones still open.
    /// Committing transactions keep their log records for recovery.
    /// Returns the number of rolled back transactions.
    pub fn close(&self) -> usize {
        {
            // Nothing registers past this point.
            let _guard = self.begin_lock.lock();
            self.closed.store(true, Ordering::SeqCst);
        }
        let open: Vec<_> = self
            .active_txns
            .iter()
            .filter(|entry| entry.value().state.status() == TransactionStatus::Open)
            .filter_map(|entry| entry.value().handle.upgrade())
            .collect();

        let mut rolled_back = 0;
        for txn in open {
            match txn.rollback() {
                Ok(()) => rolled_back += 1,
                Err(e) => tracing::warn!("failed to roll back transaction {}: {}", txn.id(), e),
            }
        }
        tracing::info!(
            "transaction engine closed, rolled back {} open transactions",
            rolled_back
        );
        rolled_back
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn open_transaction_count(&self) -> usize {
        self.active_txns.len()
    }

    /// Transactions recovery completed forward when the engine was opened.
    pub fn recovered_transactions(&self) -> &[TransactionLogRecord] {
        &self.recovered
    }

    /// Status of transaction `id` as far as this engine knows: open ones are
    /// looked up, everything else has terminated.
    pub fn status_of(&self, id: TransactionId) -> TransactionStatus {
        self.active_txns
            .get(&id)
            .map_or(TransactionStatus::Closed, |entry| entry.value().state.status())
    }

    /// The oldest transaction id any open transaction may still need to see
    /// past. Generations older than the newest committed one below this are
    /// unreachable.
    pub fn low_watermark(&self) -> TransactionId {
        self.active_txns
            .iter()
            .map(|entry| entry.value().state.floor())
            .min()
            .unwrap_or_else(|| self.id_generator.current())
    }

    /// Prune unreachable generations from every open map and collect the
    /// transactions that have been open for too long.
    pub fn checkpoint(&self) -> CheckpointReport {
        let watermark = self.low_watermark();
        let pruners: Vec<_> = self
            .stores
            .iter()
            .map(|entry| entry.value().pruner.clone())
            .collect();
        let pruned: usize = pruners
            .iter()
            .map(|pruner| pruner.prune(self, watermark))
            .sum();

        let mut still_open = Vec::new();
        let timeout = self.config.transaction_timeout_secs;
        if timeout > 0 {
            for entry in self.active_txns.iter() {
                let state = &entry.value().state;
                let open_secs = state.open_secs();
                if open_secs >= timeout {
                    tracing::warn!(
                        "transaction {} has been open for {} seconds",
                        state.id(),
                        open_secs
                    );
                    still_open.push((state.id(), open_secs));
                }
            }
        }
        still_open.sort_unstable();
        let still_open = still_open
            .into_iter()
            .map(|(id, open_secs)| TransactionError::StillOpen { id, open_secs })
            .collect();
        CheckpointReport { pruned, still_open }
    }

    // ---- Visibility support ----

    /// Whether generations written by `id` count as committed.
    pub(crate) fn is_committed(&self, id: TransactionId) -> bool {
        if id == TransactionId::COMMITTED {
            return true;
        }
        if self.unfinished.contains(&id) {
            return false;
        }
        match self.active_txns.get(&id) {
            Some(entry) => entry.value().state.is_committed(),
            None => true,
        }
    }

    /// The state of `id` if it is still writing, i.e. neither committed nor gone.
    pub(crate) fn blocking_writer(&self, id: TransactionId) -> Option<Arc<TxnState>> {
        if id == TransactionId::COMMITTED {
            return None;
        }
        let entry = self.active_txns.get(&id)?;
        let state = &entry.value().state;
        (!state.is_committed()).then(|| state.clone())
    }

    pub(crate) fn capture_snapshot(&self, reader: TransactionId) -> Snapshot {
        let in_flight = self
            .active_txns
            .range(..reader)
            .filter(|entry| entry.value().state.status() != TransactionStatus::Closed)
            .map(|entry| *entry.key())
            .collect();
        Snapshot { in_flight }
    }

    pub(crate) fn deregister(&self, id: TransactionId) {
        if self.active_txns.remove(&id).is_some() {
            tracing::debug!("transaction {} finished", id);
        }
    }

    // ---- Map registry ----

    pub(crate) fn map_store<K, V, S>(&self, name: &str, storage: &S) -> TxnResult<Arc<MapStore<K, V>>>
    where
        K: MapKey,
        V: MapValue,
        S: Storage,
    {
        if name == TRANSACTION_LOG_MAP
            || name == TRANSACTION_META_MAP
            || name.ends_with(VERSIONS_SUFFIX)
        {
            return Err(StorageError::InvalidMapName(name.to_string()).into());
        }

        if !self.stores.contains_key(name) {
            let (store, max_id) = MapStore::<K, V>::open(name, storage, self.config.lock_stripes)?;
            self.id_generator.update_if_greater(max_id)?;
            let discarded = store.discard_unfinished(&self.unfinished);
            if discarded > 0 {
                tracing::info!(
                    "unlinked {} generations of unfinished transactions from map {}",
                    discarded,
                    name
                );
            }
            let store = Arc::new(store);
            self.stores
                .entry(name.to_string())
                .or_insert_with(|| RegisteredStore {
                    store: store.clone(),
                    pruner: store,
                    type_name: store_type_name::<K, V>(),
                });
        }

        let (store, existing) = match self.stores.get(name) {
            Some(entry) => (entry.store.clone(), entry.type_name),
            None => {
                return Err(TransactionError::IllegalState(format!(
                    "map {name} was dropped while being opened"
                )));
            }
        };
        store.downcast::<MapStore<K, V>>().map_err(|_| {
            StorageError::TypeMismatch {
                name: name.to_string(),
                existing,
                requested: store_type_name::<K, V>(),
            }
            .into()
        })
    }
}
