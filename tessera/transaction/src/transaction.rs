//! The transaction state machine
//!
//! A transaction moves OPEN → CLOSED on a local commit or a rollback, and
//! OPEN → COMMITTING → CLOSED when it takes part in a two-phase or replicated
//! commit. Savepoint rollback never changes the status.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tessera_storage::Storage;

use crate::error::{TransactionError, TxnResult};
use crate::isolation::IsolationLevel;
use crate::log::TransactionLogRecord;
use crate::manager::TransactionEngine;
use crate::map::{MapKey, MapValue, TransactionMap};
use crate::participant::{Participant, Validator, host_and_port, split_local_transaction_names};
use crate::txn_id::TransactionId;
use crate::undo::{UndoLog, UndoLogRecord, replay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionStatus {
    Closed = 0,
    Open = 1,
    Committing = 3,
}

impl TransactionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransactionStatus::Open,
            3 => TransactionStatus::Committing,
            _ => TransactionStatus::Closed,
        }
    }
}

pub(crate) type Waiter = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Waiters {
    terminated: bool,
    pending: Vec<Waiter>,
}

/// The part of a transaction other transactions look at: its id, its status
/// and the callbacks waiting for it to terminate.
pub(crate) struct TxnState {
    id: TransactionId,
    /// Oldest transaction id that was open when this one began.
    floor: TransactionId,
    status: AtomicU8,
    aborted: AtomicBool,
    started_at: Instant,
    waiters: Mutex<Waiters>,
}

impl TxnState {
    pub(crate) fn new(id: TransactionId, floor: TransactionId) -> Self {
        Self {
            id,
            floor: floor.min(id),
            status: AtomicU8::new(TransactionStatus::Open as u8),
            aborted: AtomicBool::new(false),
            started_at: Instant::now(),
            waiters: Mutex::new(Waiters::default()),
        }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn floor(&self) -> TransactionId {
        self.floor
    }

    pub(crate) fn status(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: TransactionStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Closed without being rolled back.
    pub(crate) fn is_committed(&self) -> bool {
        self.status() == TransactionStatus::Closed && !self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn open_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Run `waiter` once this transaction terminates. Hands the waiter back
    /// if that already happened.
    pub(crate) fn add_waiter(&self, waiter: Waiter) -> Result<(), Waiter> {
        let mut waiters = self.waiters.lock();
        if waiters.terminated {
            return Err(waiter);
        }
        waiters.pending.push(waiter);
        Ok(())
    }

    fn terminate(&self) {
        let pending = {
            let mut waiters = self.waiters.lock();
            waiters.terminated = true;
            std::mem::take(&mut waiters.pending)
        };
        for waiter in pending {
            waiter();
        }
    }
}

/// Transactions that were neither committed nor terminated when a snapshot
/// was captured. Their writes stay invisible to the snapshot's owner.
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    pub(crate) in_flight: HashSet<TransactionId>,
}

/// How one read decides which generations it may see.
pub(crate) struct ReadView {
    id: TransactionId,
    level: IsolationLevel,
    snapshot: Option<Arc<Snapshot>>,
}

impl ReadView {
    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn is_visible(&self, writer: TransactionId, engine: &TransactionEngine) -> bool {
        if writer == self.id || writer == TransactionId::COMMITTED {
            return true;
        }
        match (self.level, &self.snapshot) {
            (IsolationLevel::ReadUncommitted, _) => true,
            (_, Some(snapshot)) => {
                writer < self.id
                    && !snapshot.in_flight.contains(&writer)
                    && engine.is_committed(writer)
            }
            (_, None) => engine.is_committed(writer),
        }
    }
}

#[derive(Default)]
struct TxnInner {
    // ---- Undo & savepoints ----
    undo_log: UndoLog,
    savepoints: Vec<(String, usize)>,
    /// Whether the log already holds an OPEN record for this transaction.
    write_logged: bool,
    // ---- Session flags ----
    auto_commit: bool,
    local: bool,
    // ---- Distributed commit ----
    local_transaction_names: Vec<String>,
    global_transaction_name: Option<String>,
    participants: Vec<Arc<dyn Participant>>,
    validator: Option<Arc<dyn Validator>>,
    prepared_names: Option<String>,
    replication_valid_key: Option<u64>,
    point_of_no_return: bool,
}

pub struct Transaction {
    engine: Arc<TransactionEngine>,
    state: Arc<TxnState>,
    // ---- Isolation ----
    isolation_level: AtomicI32,
    /// Set by the first read or write, after which the level is frozen.
    touched: AtomicBool,
    snapshot: OnceLock<Arc<Snapshot>>,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    pub(crate) fn new(
        engine: Arc<TransactionEngine>,
        state: Arc<TxnState>,
        auto_commit: bool,
        isolation_level: IsolationLevel,
    ) -> Self {
        Self {
            engine,
            state,
            isolation_level: AtomicI32::new(isolation_level.wire_value()),
            touched: AtomicBool::new(false),
            snapshot: OnceLock::new(),
            inner: Mutex::new(TxnInner {
                auto_commit,
                local: true,
                ..TxnInner::default()
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.state.id()
    }

    pub fn status(&self) -> TransactionStatus {
        self.state.status()
    }

    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    pub(crate) fn state(&self) -> &Arc<TxnState> {
        &self.state
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        IsolationLevel::from_wire(self.isolation_level.load(Ordering::SeqCst)).unwrap_or_default()
    }

    /// Change the isolation level. Only allowed before the first read or write.
    pub fn set_isolation_level(&self, level: IsolationLevel) -> TxnResult<()> {
        self.check_writable()?;
        if self.touched.load(Ordering::SeqCst) {
            return Err(TransactionError::IllegalState(format!(
                "isolation level of transaction {} cannot change after its first read or write",
                self.id()
            )));
        }
        self.isolation_level
            .store(level.wire_value(), Ordering::SeqCst);
        Ok(())
    }

    pub fn is_auto_commit(&self) -> bool {
        self.inner.lock().auto_commit
    }

    pub fn set_auto_commit(&self, auto_commit: bool) {
        self.inner.lock().auto_commit = auto_commit;
    }

    pub fn is_local(&self) -> bool {
        self.inner.lock().local
    }

    pub fn set_local(&self, local: bool) {
        self.inner.lock().local = local;
    }

    /// Name of this transaction on this node: `host:port:id` when the engine
    /// has a node address, the bare id otherwise.
    pub fn local_transaction_name(&self) -> String {
        match &self.engine.config().node_address {
            Some(address) => format!("{address}:{}", self.id()),
            None => self.id().to_string(),
        }
    }

    /// Merge a comma-separated list of local transaction names.
    pub fn add_local_transaction_names(&self, names: &str) {
        let mut inner = self.inner.lock();
        for name in split_local_transaction_names(names) {
            if !inner.local_transaction_names.iter().any(|n| n == name) {
                inner.local_transaction_names.push(name.to_string());
            }
        }
    }

    pub fn local_transaction_names(&self) -> Option<String> {
        let inner = self.inner.lock();
        (!inner.local_transaction_names.is_empty()).then(|| inner.local_transaction_names.join(","))
    }

    pub fn global_transaction_name(&self) -> Option<String> {
        self.inner.lock().global_transaction_name.clone()
    }

    pub fn set_global_transaction_name(&self, name: impl Into<String>) {
        self.inner.lock().global_transaction_name = Some(name.into());
    }

    pub fn set_validator(&self, validator: Arc<dyn Validator>) {
        self.inner.lock().validator = Some(validator);
    }

    pub fn add_participant(&self, participant: Arc<dyn Participant>) {
        let mut inner = self.inner.lock();
        inner.local = false;
        inner.participants.push(participant);
    }

    pub fn replication_valid_key(&self) -> Option<u64> {
        self.inner.lock().replication_valid_key
    }

    /// Open a transactional view of the storage map called `name`.
    pub fn open_map<K, V, S>(self: &Arc<Self>, name: &str, storage: &S) -> TxnResult<TransactionMap<K, V>>
    where
        K: MapKey,
        V: MapValue,
        S: Storage,
    {
        self.ensure_open()?;
        let store = self.engine.map_store::<K, V, S>(name, storage)?;
        Ok(TransactionMap::new(store, self.clone()))
    }

    // ---- Savepoints ----

    pub fn add_savepoint(&self, name: &str) -> TxnResult<()> {
        self.check_writable()?;
        let participants = {
            let mut inner = self.inner.lock();
            let index = inner.undo_log.len();
            inner.savepoints.retain(|(n, _)| n != name);
            inner.savepoints.push((name.to_string(), index));
            inner.participants.clone()
        };
        for participant in participants {
            participant.add_savepoint(name)?;
        }
        Ok(())
    }

    /// The current undo log length, usable with [`rollback_to_savepoint_id`](Self::rollback_to_savepoint_id).
    pub fn savepoint_id(&self) -> usize {
        self.inner.lock().undo_log.len()
    }

    pub fn rollback_to_savepoint(&self, name: &str) -> TxnResult<()> {
        self.check_writable()?;
        let (records, participants) = {
            let mut inner = self.inner.lock();
            let Some(position) = inner.savepoints.iter().position(|(n, _)| n == name) else {
                return Err(TransactionError::IllegalState(format!(
                    "savepoint {name} not found in transaction {}",
                    self.id()
                )));
            };
            let index = inner.savepoints[position].1;
            inner.savepoints.truncate(position + 1);
            (inner.undo_log.split_off(index), inner.participants.clone())
        };
        tracing::debug!(
            "transaction {} rolls back {} writes to savepoint {}",
            self.id(),
            records.len(),
            name
        );
        replay(records);
        for participant in participants {
            participant.rollback_to_savepoint(name)?;
        }
        Ok(())
    }

    pub fn rollback_to_savepoint_id(&self, savepoint_id: usize) -> TxnResult<()> {
        self.check_writable()?;
        let records = {
            let mut inner = self.inner.lock();
            if savepoint_id > inner.undo_log.len() {
                return Err(TransactionError::IllegalState(format!(
                    "savepoint id {savepoint_id} is beyond the {} writes of transaction {}",
                    inner.undo_log.len(),
                    self.id()
                )));
            }
            inner.savepoints.retain(|(_, index)| *index <= savepoint_id);
            inner.undo_log.split_off(savepoint_id)
        };
        tracing::debug!(
            "transaction {} rolls back {} writes to savepoint id {}",
            self.id(),
            records.len(),
            savepoint_id
        );
        replay(records);
        Ok(())
    }

    // ---- Commit ----

    /// Enter the COMMITTING state using the accumulated local transaction names.
    pub fn prepare_commit(&self) -> TxnResult<()> {
        let names = self
            .local_transaction_names()
            .unwrap_or_else(|| self.local_transaction_name());
        self.prepare_commit_with(&names)
    }

    /// Enter the COMMITTING state, persist the transaction log record and ask
    /// the validator to confirm every other node's local transaction.
    pub fn prepare_commit_with(&self, all_local_names: &str) -> TxnResult<()> {
        self.check_writable()?;

        // Step 1: Persist the intent to commit.
        let (record, validator) = {
            let mut inner = self.inner.lock();
            inner.prepared_names = Some(all_local_names.to_string());
            let mut record = TransactionLogRecord::new(self.id(), TransactionStatus::Committing);
            record.global_transaction_name = inner.global_transaction_name.clone();
            record.all_local_transaction_names = Some(all_local_names.to_string());
            (record, inner.validator.clone())
        };
        self.state.set_status(TransactionStatus::Committing);
        if let Err(e) = self.engine.log().write(&record) {
            self.rollback_local();
            return Err(e);
        }

        // Step 2: Confirm the other nodes are ready.
        if let Some(validator) = validator {
            let own = self.local_transaction_name();
            for name in split_local_transaction_names(all_local_names).filter(|n| *n != own) {
                let valid = match host_and_port(name) {
                    Some(address) => validator.validate_at(address, name),
                    None => validator.validate(name),
                };
                if !valid {
                    tracing::warn!("validator rejected {} for transaction {}", name, self.id());
                    return self.abort_distributed(format!("{name} was not validated"));
                }
            }
        }
        Ok(())
    }

    /// Commit the transaction.
    ///
    /// Without participants this is a local commit. With participants the
    /// transaction is prepared first (unless it already is) and then committed
    /// on every participant.
    pub fn commit(&self) -> TxnResult<()> {
        match self.status() {
            TransactionStatus::Closed => Err(TransactionError::Closed(self.id())),
            TransactionStatus::Committing => {
                let (prepared, has_participants) = {
                    let inner = self.inner.lock();
                    (inner.prepared_names.clone(), !inner.participants.is_empty())
                };
                match prepared {
                    Some(names) if has_participants => self.commit_participants(&names),
                    _ => {
                        self.commit_local(false);
                        Ok(())
                    }
                }
            }
            TransactionStatus::Open => {
                if self.inner.lock().participants.is_empty() {
                    self.commit_local(false);
                    return Ok(());
                }
                let names = self
                    .local_transaction_names()
                    .unwrap_or_else(|| self.local_transaction_name());
                self.commit_with(&names)
            }
        }
    }

    /// Two-phase commit across every participant.
    ///
    /// A participant failing after another one acknowledged cannot undo the
    /// commit any more: the transaction is committed locally, its log record
    /// is kept for recovery and the returned
    /// [`TransactionError::DistributedCommitFailed`] names the pending
    /// participants.
    pub fn commit_with(&self, all_local_names: &str) -> TxnResult<()> {
        if self.status() == TransactionStatus::Closed {
            return Err(TransactionError::Closed(self.id()));
        }
        if self.status() == TransactionStatus::Open {
            self.prepare_commit_with(all_local_names)?;
        }
        self.commit_participants(all_local_names)
    }

    /// Enter the COMMITTING state while the writes are shipped to replicas.
    /// The writes stay invisible to other transactions until [`commit`](Self::commit).
    pub fn replication_prepare_commit(&self, valid_key: u64) -> TxnResult<()> {
        self.check_writable()?;
        let record = {
            let mut inner = self.inner.lock();
            inner.replication_valid_key = Some(valid_key);
            let mut record = TransactionLogRecord::new(self.id(), TransactionStatus::Committing);
            record.global_transaction_name = inner.global_transaction_name.clone();
            record
        };
        self.state.set_status(TransactionStatus::Committing);
        self.engine.log().write(&record)
    }

    fn commit_participants(&self, all_local_names: &str) -> TxnResult<()> {
        let participants = self.inner.lock().participants.clone();
        let mut acknowledged = 0;
        let mut pending = Vec::new();
        for participant in &participants {
            match participant.commit_transaction(all_local_names) {
                Ok(()) => acknowledged += 1,
                Err(e) if acknowledged == 0 => {
                    tracing::warn!(
                        "participant {} failed to commit transaction {}: {}",
                        participant.name(),
                        self.id(),
                        e
                    );
                    return self.abort_distributed(format!("{}: {e}", participant.name()));
                }
                Err(e) => {
                    tracing::warn!(
                        "participant {} failed to commit transaction {} after the point of no return: {}",
                        participant.name(),
                        self.id(),
                        e
                    );
                    pending.push(participant.name().to_string());
                }
            }
        }

        if pending.is_empty() {
            self.commit_local(false);
            return Ok(());
        }

        // Past the point of no return: finish locally, leave the record for
        // recovery and still tell the caller.
        let record = {
            let mut inner = self.inner.lock();
            inner.point_of_no_return = true;
            let mut record = TransactionLogRecord::new(self.id(), TransactionStatus::Committing);
            record.global_transaction_name = inner.global_transaction_name.clone();
            record.all_local_transaction_names = Some(all_local_names.to_string());
            record.pending_participants = pending;
            record
        };
        let logged = self.engine.log().write(&record);
        self.commit_local(true);
        logged?;
        Err(TransactionError::DistributedCommitFailed {
            name: self.local_transaction_name(),
            reason: format!(
                "committed locally, pending participants: {}",
                record.pending_participants.join(", ")
            ),
        })
    }

    /// Undo everything after a failed prepare or commit and tell every
    /// participant to do the same.
    fn abort_distributed(&self, reason: String) -> TxnResult<()> {
        let participants = self.inner.lock().participants.clone();
        for participant in &participants {
            if let Err(e) = participant.rollback_transaction() {
                tracing::warn!(
                    "participant {} failed to roll back transaction {}: {}",
                    participant.name(),
                    self.id(),
                    e
                );
            }
        }
        self.rollback_local();
        Err(TransactionError::DistributedCommitFailed {
            name: self.local_transaction_name(),
            reason,
        })
    }

    fn commit_local(&self, keep_log_record: bool) {
        let discarded = {
            let mut inner = self.inner.lock();
            inner.savepoints.clear();
            inner.undo_log.take()
        };
        self.state.set_status(TransactionStatus::Closed);
        if !keep_log_record {
            self.engine.log().remove(self.id());
        }
        tracing::debug!(
            "transaction {} committed {} writes",
            self.id(),
            discarded.len()
        );
        self.finish();
    }

    // ---- Rollback ----

    pub fn rollback(&self) -> TxnResult<()> {
        let participants = {
            let inner = self.inner.lock();
            if inner.point_of_no_return {
                return Err(TransactionError::IllegalState(format!(
                    "transaction {} is past the point of no return",
                    self.id()
                )));
            }
            inner.participants.clone()
        };
        if self.status() == TransactionStatus::Closed {
            return Err(TransactionError::Closed(self.id()));
        }
        for participant in &participants {
            if let Err(e) = participant.rollback_transaction() {
                tracing::warn!(
                    "participant {} failed to roll back transaction {}: {}",
                    participant.name(),
                    self.id(),
                    e
                );
            }
        }
        self.rollback_local();
        Ok(())
    }

    fn rollback_local(&self) {
        let records = {
            let mut inner = self.inner.lock();
            inner.savepoints.clear();
            inner.undo_log.take()
        };
        tracing::debug!(
            "transaction {} rolls back {} writes",
            self.id(),
            records.len()
        );
        replay(records);
        self.state.aborted.store(true, Ordering::SeqCst);
        self.state.set_status(TransactionStatus::Closed);
        self.engine.log().remove(self.id());
        self.finish();
    }

    fn finish(&self) {
        self.engine.deregister(self.id());
        self.state.terminate();
    }

    // ---- Helpers for maps ----

    pub(crate) fn ensure_open(&self) -> TxnResult<()> {
        match self.status() {
            TransactionStatus::Closed => Err(TransactionError::Closed(self.id())),
            _ => Ok(()),
        }
    }

    pub(crate) fn check_writable(&self) -> TxnResult<()> {
        match self.status() {
            TransactionStatus::Open => Ok(()),
            TransactionStatus::Closed => Err(TransactionError::Closed(self.id())),
            TransactionStatus::Committing => Err(TransactionError::IllegalState(format!(
                "transaction {} is committing",
                self.id()
            ))),
        }
    }

    pub(crate) fn mark_touched(&self) {
        self.touched.store(true, Ordering::SeqCst);
    }

    /// Persist an OPEN record before the first write, so a restart can tell
    /// this transaction's generations apart from committed ones.
    pub(crate) fn log_first_write(&self) -> TxnResult<()> {
        let record = {
            let inner = self.inner.lock();
            if inner.write_logged {
                return Ok(());
            }
            let mut record = TransactionLogRecord::new(self.id(), TransactionStatus::Open);
            record.global_transaction_name = inner.global_transaction_name.clone();
            record
        };
        self.engine.log().write(&record)?;
        self.inner.lock().write_logged = true;
        Ok(())
    }

    pub(crate) fn log_undo(&self, record: UndoLogRecord) {
        self.inner.lock().undo_log.push(record);
    }

    /// The view reads are evaluated in. Snapshot levels capture their
    /// snapshot here on the first read.
    ///
    /// A closed transaction keeps reading the latest committed data.
    pub(crate) fn read_view(&self) -> ReadView {
        if self.status() == TransactionStatus::Closed {
            return ReadView {
                id: self.id(),
                level: IsolationLevel::ReadCommitted,
                snapshot: None,
            };
        }
        self.mark_touched();
        let level = self.isolation_level();
        let snapshot = level.uses_snapshot().then(|| {
            self.snapshot
                .get_or_init(|| Arc::new(self.engine.capture_snapshot(self.id())))
                .clone()
        });
        ReadView {
            id: self.id(),
            level,
            snapshot,
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("isolation_level", &self.isolation_level())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        match self.status() {
            TransactionStatus::Open => {
                tracing::debug!("transaction {} dropped while open, rolling back", self.id());
                self.rollback_local();
            }
            TransactionStatus::Committing => {
                // The log record stays so recovery can tell the cluster layer.
                self.commit_local(true);
            }
            TransactionStatus::Closed => {}
        }
    }
}
