//! Collaborators of the two-phase commit protocol.
//!
//! A [`Participant`] is a remote node holding part of a distributed
//! transaction. A [`Validator`] confirms that a node's local transaction is
//! ready before the coordinator finalizes the commit.

use crate::error::TxnResult;

pub trait Participant: Send + Sync {
    /// Human-readable name used in logs and pending-participant bookkeeping.
    fn name(&self) -> &str;

    fn add_savepoint(&self, name: &str) -> TxnResult<()>;

    fn rollback_to_savepoint(&self, name: &str) -> TxnResult<()>;

    /// Commit the participant's part. `all_local_names` is the comma-separated
    /// list of every node-local transaction name of the distributed transaction.
    fn commit_transaction(&self, all_local_names: &str) -> TxnResult<()>;

    fn rollback_transaction(&self) -> TxnResult<()>;
}

pub trait Validator: Send + Sync {
    fn validate(&self, local_transaction_name: &str) -> bool;

    /// Validate a local transaction living on the node at `host_and_port`.
    fn validate_at(&self, host_and_port: &str, local_transaction_name: &str) -> bool {
        let _ = host_and_port;
        self.validate(local_transaction_name)
    }
}

/// Split a comma-separated list of local transaction names.
pub fn split_local_transaction_names(names: &str) -> impl Iterator<Item = &str> {
    names.split(',').map(str::trim).filter(|name| !name.is_empty())
}

/// The `host:port` prefix of a `host:port:id` local transaction name.
pub fn host_and_port(local_transaction_name: &str) -> Option<&str> {
    let (prefix, id) = local_transaction_name.rsplit_once(':')?;
    if id.is_empty() || !prefix.contains(':') {
        return None;
    }
    Some(prefix)
}
