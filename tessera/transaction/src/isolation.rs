use serde::{Deserialize, Serialize};

use crate::error::TransactionError;

/// The four standard SQL isolation levels.
///
/// Discriminants are the JDBC wire values client drivers send directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum IsolationLevel {
    ReadUncommitted = 1,
    #[default]
    ReadCommitted = 2,
    RepeatableRead = 4,
    Serializable = 8,
}

impl IsolationLevel {
    pub fn wire_value(self) -> i32 {
        self as i32
    }

    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            1 => Some(IsolationLevel::ReadUncommitted),
            2 => Some(IsolationLevel::ReadCommitted),
            4 => Some(IsolationLevel::RepeatableRead),
            8 => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }

    /// Whether reads are evaluated against a snapshot fixed at the first read.
    pub fn uses_snapshot(self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }
}

impl TryFrom<i32> for IsolationLevel {
    type Error = TransactionError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::from_wire(value).ok_or_else(|| {
            TransactionError::IllegalState(format!("unknown isolation level {value}"))
        })
    }
}
