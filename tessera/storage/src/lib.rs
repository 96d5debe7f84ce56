//! Ordered key-value storage consumed by the transaction engine.
//!
//! The transaction layer only relies on the [`StorageMap`] and [`Storage`]
//! traits; [`MemoryStorage`] is the lock-free in-memory implementation used by
//! embedded deployments and tests.

pub mod error;
pub mod map;
pub mod memory;
pub mod storage;

pub use error::{StorageError, StorageResult};
pub use map::{Cursor, StorageMap};
pub use memory::{MemoryMap, MemoryStorage};
pub use storage::Storage;
