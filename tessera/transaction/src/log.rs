//! Persisted transaction metadata
//!
//! A transaction that enters the COMMITTING state writes one record into the
//! `__transactions` storage map. The record is removed once the commit has
//! reached every participant; whatever is left behind after a crash is
//! resolved by recovery when the engine is opened again.

use std::ops::Bound;
use std::sync::Arc;

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tessera_storage::{Storage, StorageMap};

use crate::error::{TransactionError, TxnResult};
use crate::transaction::TransactionStatus;
use crate::txn_id::TransactionId;

/// Name of the storage map holding transaction log records.
pub const TRANSACTION_LOG_MAP: &str = "__transactions";

/// Name of the storage map holding the transaction id high-water mark.
pub const TRANSACTION_META_MAP: &str = "__transaction_meta";

const RESERVED_IDS_KEY: &str = "reserved_ids";

const CHECKSUM_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogRecord {
    pub id: TransactionId,
    pub status: TransactionStatus,
    pub global_transaction_name: Option<String>,
    /// Comma-separated local transaction names of every node involved.
    pub all_local_transaction_names: Option<String>,
    /// Participants that had not acknowledged the commit when the point of no
    /// return was passed.
    pub pending_participants: Vec<String>,
}

impl TransactionLogRecord {
    pub fn new(id: TransactionId, status: TransactionStatus) -> Self {
        Self {
            id,
            status,
            global_transaction_name: None,
            all_local_transaction_names: None,
            pending_participants: Vec::new(),
        }
    }

    /// Encode as `[checksum (4 bytes)] [payload]`.
    pub fn to_bytes(&self) -> TxnResult<Vec<u8>> {
        let payload = postcard::to_allocvec(self)
            .map_err(|e| TransactionError::Corrupt(format!("cannot encode record: {e}")))?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();

        let mut data = Vec::with_capacity(CHECKSUM_SIZE + payload.len());
        data.extend_from_slice(&checksum.to_le_bytes());
        data.extend_from_slice(&payload);
        Ok(data)
    }

    pub fn from_bytes(bytes: &[u8]) -> TxnResult<Self> {
        if bytes.len() < CHECKSUM_SIZE {
            return Err(TransactionError::Corrupt(format!(
                "record of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let (header, payload) = bytes.split_at(CHECKSUM_SIZE);
        let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let mut hasher = Hasher::new();
        hasher.update(payload);
        let actual = hasher.finalize();
        if actual != expected {
            return Err(TransactionError::Corrupt(format!(
                "checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            )));
        }
        postcard::from_bytes(payload)
            .map_err(|e| TransactionError::Corrupt(format!("cannot decode record: {e}")))
    }
}

/// Transaction log stored in a regular storage map keyed by transaction id.
pub struct TransactionLog {
    map: Arc<dyn StorageMap<u64, Vec<u8>>>,
    meta: Arc<dyn StorageMap<String, u64>>,
}

impl TransactionLog {
    pub fn open<S: Storage>(storage: &S) -> TxnResult<Self> {
        let map = storage.open_map::<u64, Vec<u8>>(TRANSACTION_LOG_MAP)?;
        let meta = storage.open_map::<String, u64>(TRANSACTION_META_MAP)?;
        Ok(Self { map, meta })
    }

    /// Ids below this value may have been handed out by an earlier run.
    pub fn reserved_ids(&self) -> u64 {
        self.meta.get(&RESERVED_IDS_KEY.to_string()).unwrap_or(1)
    }

    /// Record that ids below `until` may be in use.
    pub fn reserve_ids(&self, until: u64) {
        self.meta.put(RESERVED_IDS_KEY.to_string(), until);
    }

    pub fn write(&self, record: &TransactionLogRecord) -> TxnResult<()> {
        self.map.put(record.id.raw(), record.to_bytes()?);
        Ok(())
    }

    pub fn remove(&self, id: TransactionId) -> bool {
        self.map.remove(&id.raw()).is_some()
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.map.contains_key(&id.raw())
    }

    /// Decode every record in id order. The first damaged record aborts the scan.
    pub fn read_all(&self) -> TxnResult<Vec<TransactionLogRecord>> {
        let mut records = Vec::with_capacity(self.map.size());
        let mut next = Bound::Unbounded;
        while let Some((id, bytes)) = self.map.next_entry(next.as_ref()) {
            let record = TransactionLogRecord::from_bytes(&bytes)?;
            if record.id.raw() != id {
                return Err(TransactionError::Corrupt(format!(
                    "record stored under id {id} belongs to transaction {}",
                    record.id
                )));
            }
            records.push(record);
            next = Bound::Excluded(id);
        }
        Ok(records)
    }

    pub fn len(&self) -> usize {
        self.map.size()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
