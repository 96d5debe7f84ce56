use tessera_storage::StorageError;
use thiserror::Error;

use crate::txn_id::TransactionId;

pub type TxnResult<T> = Result<T, TransactionError>;

/// Stable, machine-readable error codes.
///
/// Client tooling branches on these values instead of matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Closed = 4,
    TransactionCorrupt = 100,
    TransactionLocked = 101,
    TooManyOpenTransactions = 102,
    TransactionIllegalState = 103,
    TransactionStillOpen = 104,
    DistributedCommitFailed = 105,
    DuplicateKey = 106,
    Storage = 107,
    IdOverflow = 108,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("transaction id overflow, reached {0}")]
    Overflow(u64),

    #[error("version generation overflow, reached {0}")]
    GenerationOverflow(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction {0} is closed")]
    Closed(TransactionId),

    #[error("transaction store is corrupt: {0}")]
    Corrupt(String),

    #[error("entry {key} in map {map} is locked by another transaction")]
    Locked { map: String, key: String },

    #[error("too many open transactions, limit is {limit}")]
    TooManyOpenTransactions { limit: usize },

    #[error("illegal transaction state: {0}")]
    IllegalState(String),

    #[error("transaction {id} has been open for {open_secs} seconds")]
    StillOpen { id: TransactionId, open_secs: u64 },

    #[error("distributed commit of {name} failed: {reason}")]
    DistributedCommitFailed { name: String, reason: String },

    #[error("duplicate key {key} in map {map}")]
    DuplicateKey { map: String, key: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Id(#[from] IdError),
}

impl TransactionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TransactionError::Closed(_) => ErrorCode::Closed,
            TransactionError::Corrupt(_) => ErrorCode::TransactionCorrupt,
            TransactionError::Locked { .. } => ErrorCode::TransactionLocked,
            TransactionError::TooManyOpenTransactions { .. } => {
                ErrorCode::TooManyOpenTransactions
            }
            TransactionError::IllegalState(_) => ErrorCode::TransactionIllegalState,
            TransactionError::StillOpen { .. } => ErrorCode::TransactionStillOpen,
            TransactionError::DistributedCommitFailed { .. } => ErrorCode::DistributedCommitFailed,
            TransactionError::DuplicateKey { .. } => ErrorCode::DuplicateKey,
            TransactionError::Storage(_) => ErrorCode::Storage,
            TransactionError::Id(_) => ErrorCode::IdOverflow,
        }
    }
}
