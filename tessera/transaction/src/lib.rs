//! Multi-version transaction engine for tessera.
//!
//! Transactions read and write through [`TransactionMap`]s, transactional
//! views over the ordered maps of a [`tessera_storage::Storage`]. Every key
//! keeps a chain of immutable generations; readers pick the newest generation
//! their isolation level allows, writers replace the head optimistically and
//! record what they replaced in the transaction's undo log. Transactions that
//! span several nodes commit through a two-phase protocol driven by
//! [`Participant`]s.

pub mod config;
pub mod error;
pub mod isolation;
pub mod listener;
pub mod log;
pub mod manager;
pub mod map;
pub mod participant;
pub mod transaction;
pub mod txn_id;
mod undo;
pub mod version;

pub use config::EngineConfig;
pub use error::{ErrorCode, IdError, TransactionError, TxnResult};
pub use isolation::IsolationLevel;
pub use listener::{Completion, Listener, SyncListener};
pub use log::{TRANSACTION_LOG_MAP, TRANSACTION_META_MAP, TransactionLog, TransactionLogRecord};
pub use manager::{CheckpointReport, TransactionEngine};
pub use map::{EntryIter, KeyIter, MapKey, MapValue, TransactionMap};
pub use participant::{Participant, Validator};
pub use transaction::{Transaction, TransactionStatus};
pub use txn_id::{TransactionId, TransactionIdGenerator};
pub use version::{Generation, VersionedEntry};
