#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tessera_storage::MemoryStorage;
use tessera_transaction::{
    EngineConfig, IsolationLevel, Participant, Transaction, TransactionEngine, TransactionError,
    TransactionMap, TxnResult, Validator,
};

pub const TEST_MAP: &str = "isolation_level_test";

pub fn create_engine() -> (Arc<TransactionEngine>, MemoryStorage) {
    create_engine_with(EngineConfig::default())
}

pub fn create_engine_with(config: EngineConfig) -> (Arc<TransactionEngine>, MemoryStorage) {
    let storage = MemoryStorage::new();
    let engine = TransactionEngine::open(&storage, config).unwrap();
    (engine, storage)
}

pub fn begin(engine: &Arc<TransactionEngine>, level: IsolationLevel) -> Arc<Transaction> {
    let txn = engine.begin_transaction(false).unwrap();
    txn.set_isolation_level(level).unwrap();
    txn
}

pub fn open_test_map(
    txn: &Arc<Transaction>,
    storage: &MemoryStorage,
) -> TransactionMap<String, String> {
    txn.open_map(TEST_MAP, storage).unwrap()
}

/// Commit `(key, value)` pairs in a transaction of their own.
pub fn seed(engine: &Arc<TransactionEngine>, storage: &MemoryStorage, pairs: &[(&str, &str)]) {
    let txn = engine.begin_transaction(false).unwrap();
    let map = open_test_map(&txn, storage);
    for (key, value) in pairs {
        map.put(key.to_string(), value.to_string()).unwrap();
    }
    txn.commit().unwrap();
}

pub fn s(value: &str) -> Option<String> {
    Some(value.to_string())
}

/// A participant that records every call it receives.
pub struct RecordingParticipant {
    name: String,
    fail_commit: AtomicBool,
    pub calls: Mutex<Vec<String>>,
}

impl RecordingParticipant {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail_commit: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        let participant = Self::new(name);
        participant.fail_commit.store(true, Ordering::SeqCst);
        participant
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl Participant for RecordingParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_savepoint(&self, name: &str) -> TxnResult<()> {
        self.calls.lock().push(format!("add_savepoint {name}"));
        Ok(())
    }

    fn rollback_to_savepoint(&self, name: &str) -> TxnResult<()> {
        self.calls.lock().push(format!("rollback_to_savepoint {name}"));
        Ok(())
    }

    fn commit_transaction(&self, all_local_names: &str) -> TxnResult<()> {
        self.calls.lock().push(format!("commit {all_local_names}"));
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(TransactionError::IllegalState(format!(
                "{} is unreachable",
                self.name
            )));
        }
        Ok(())
    }

    fn rollback_transaction(&self) -> TxnResult<()> {
        self.calls.lock().push("rollback".to_string());
        Ok(())
    }
}

/// A validator that accepts every name except the rejected ones.
pub struct FixedValidator {
    rejected: Vec<String>,
    pub checked: Mutex<Vec<(Option<String>, String)>>,
}

impl FixedValidator {
    pub fn accepting() -> Arc<Self> {
        Self::rejecting(&[])
    }

    pub fn rejecting(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            rejected: names.iter().map(|n| n.to_string()).collect(),
            checked: Mutex::new(Vec::new()),
        })
    }
}

impl Validator for FixedValidator {
    fn validate(&self, local_transaction_name: &str) -> bool {
        self.checked
            .lock()
            .push((None, local_transaction_name.to_string()));
        !self.rejected.iter().any(|n| n == local_transaction_name)
    }

    fn validate_at(&self, host_and_port: &str, local_transaction_name: &str) -> bool {
        self.checked.lock().push((
            Some(host_and_port.to_string()),
            local_transaction_name.to_string(),
        ));
        !self.rejected.iter().any(|n| n == local_transaction_name)
    }
}
