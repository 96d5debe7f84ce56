use serde::Deserialize;

use crate::isolation::IsolationLevel;

pub const DEFAULT_MAX_OPEN_TRANSACTIONS: usize = 65_535;
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_LOCK_STRIPES: usize = 64;

/// Configuration for the [`TransactionEngine`](crate::TransactionEngine)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of transactions open at the same time (0 means unlimited)
    pub max_open_transactions: usize,
    /// Transactions open longer than this are reported by checkpoints (0 disables the check)
    pub transaction_timeout_secs: u64,
    /// Isolation level new transactions start with
    pub default_isolation_level: IsolationLevel,
    /// `host:port` of this node, used to build local transaction names
    pub node_address: Option<String>,
    /// Number of striped key locks per map
    pub lock_stripes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_open_transactions: DEFAULT_MAX_OPEN_TRANSACTIONS,
            transaction_timeout_secs: DEFAULT_TRANSACTION_TIMEOUT_SECS,
            default_isolation_level: IsolationLevel::default(),
            node_address: None,
            lock_stripes: DEFAULT_LOCK_STRIPES,
        }
    }
}
