//! Transaction id management
//!
//! Transaction ids are allocated from a strictly increasing counter owned by
//! the engine. The id doubles as the version stamp of every generation the
//! transaction writes, so it totally orders transactions for visibility.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::IdError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Stamp of generations written outside any transaction. Always committed.
    pub const COMMITTED: TransactionId = TransactionId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value of the id.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction id generator
pub struct TransactionIdGenerator {
    counter: AtomicU64,
}

impl TransactionIdGenerator {
    /// Create a new generator. The first id handed out is 1.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Create a new generator with a starting value
    pub fn with_start(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start.max(1)),
        }
    }

    /// Generate the next transaction id
    pub fn next(&self) -> Result<TransactionId, IdError> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            if cur == u64::MAX {
                return Err(IdError::Overflow(cur));
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(TransactionId(cur)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// The id the next call to [`next`](Self::next) will return.
    pub fn current(&self) -> TransactionId {
        TransactionId(self.counter.load(Ordering::SeqCst))
    }

    /// Make sure ids handed out from now on are greater than `id`.
    pub fn update_if_greater(&self, id: TransactionId) -> Result<(), IdError> {
        if id.0 == u64::MAX {
            return Err(IdError::Overflow(id.0));
        }
        self.counter.fetch_max(id.0 + 1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_ids_start_above_committed_stamp() {
        let generator = TransactionIdGenerator::new();
        let first = generator.next().unwrap();
        assert!(first > TransactionId::COMMITTED);
        assert_eq!(first.raw(), 1);
        assert_eq!(generator.next().unwrap().raw(), 2);
        assert_eq!(generator.current().raw(), 3);
    }

    #[test]
    fn test_update_if_greater() {
        let generator = TransactionIdGenerator::with_start(10);
        generator.update_if_greater(TransactionId::new(5)).unwrap();
        assert_eq!(generator.current().raw(), 10);

        generator.update_if_greater(TransactionId::new(20)).unwrap();
        assert_eq!(generator.next().unwrap().raw(), 21);

        assert!(
            generator
                .update_if_greater(TransactionId::new(u64::MAX))
                .is_err()
        );
    }

    #[test]
    fn test_overflow() {
        let generator = TransactionIdGenerator::with_start(u64::MAX - 1);
        assert_eq!(generator.next().unwrap().raw(), u64::MAX - 1);
        assert_eq!(generator.next(), Err(IdError::Overflow(u64::MAX)));
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let generator = Arc::new(TransactionIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                thread::spawn(move || {
                    (0..1000)
                        .map(|_| generator.next().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
