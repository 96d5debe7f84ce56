//! Versioned entries and the generation index that addresses them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::txn_id::TransactionId;

/// Index of one generation in a map's version arena.
///
/// The head generation of a key is the value stored for that key in the
/// underlying storage map; older generations are reached through
/// [`VersionedEntry::previous`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Generation(u64);

impl Generation {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// One immutable generation of a key's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedEntry<V> {
    /// `None` is a tombstone.
    value: Option<V>,
    transaction_id: TransactionId,
    previous: Option<Generation>,
    /// Column positions the write touched, `None` for the whole row.
    columns: Option<Vec<usize>>,
}

impl<V> VersionedEntry<V> {
    pub fn new(
        value: Option<V>,
        transaction_id: TransactionId,
        previous: Option<Generation>,
    ) -> Self {
        Self {
            value,
            transaction_id,
            previous,
            columns: None,
        }
    }

    pub fn with_columns(mut self, columns: Option<&[usize]>) -> Self {
        self.columns = columns.map(<[usize]>::to_vec);
        self
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn previous(&self) -> Option<Generation> {
        self.previous
    }

    pub fn columns(&self) -> Option<&[usize]> {
        self.columns.as_deref()
    }

    /// Whether a write to `columns` would touch the same columns as this one.
    /// A missing column set stands for the whole row.
    pub fn overlaps(&self, columns: Option<&[usize]>) -> bool {
        match (self.columns.as_deref(), columns) {
            (Some(mine), Some(theirs)) => mine.iter().any(|c| theirs.contains(c)),
            _ => true,
        }
    }
}

impl<V: Clone> VersionedEntry<V> {
    /// Copy of this generation with the link to older generations cut.
    pub fn detached(&self) -> Self {
        Self {
            value: self.value.clone(),
            transaction_id: self.transaction_id,
            previous: None,
            columns: self.columns.clone(),
        }
    }
}
