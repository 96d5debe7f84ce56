//! Completion callbacks for operations that may finish asynchronously.

use parking_lot::{Condvar, Mutex};

use crate::error::{TransactionError, TxnResult};

/// Receives the outcome of an operation such as
/// [`TransactionMap::add_if_absent`](crate::TransactionMap::add_if_absent).
///
/// Exactly one of [`operation_complete`](Listener::operation_complete) or
/// [`operation_undo`](Listener::operation_undo) is called per operation, possibly
/// on another thread once a blocking writer terminates.
pub trait Listener: Send + Sync {
    fn before_operation(&self) {}

    fn operation_complete(&self);

    fn operation_undo(&self);

    fn set_exception(&self, _error: TransactionError) {}

    fn exception(&self) -> Option<TransactionError> {
        None
    }

    /// Block until the operation has finished.
    fn await_completion(&self) -> TxnResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Complete,
    Undone,
}

#[derive(Default)]
struct Slot {
    completion: Option<Completion>,
    error: Option<TransactionError>,
}

/// Blocking adapter over [`Listener`]: the caller parks in
/// [`await_completion`](Listener::await_completion) until the operation signals.
#[derive(Default)]
pub struct SyncListener {
    slot: Mutex<Slot>,
    signal: Condvar,
}

impl SyncListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// How the operation finished, if it has.
    pub fn completion(&self) -> Option<Completion> {
        self.slot.lock().completion
    }

    fn finish(&self, completion: Completion) {
        let mut slot = self.slot.lock();
        // Only the first signal counts.
        if slot.completion.is_none() {
            slot.completion = Some(completion);
            self.signal.notify_all();
        }
    }
}

impl Listener for SyncListener {
    fn operation_complete(&self) {
        self.finish(Completion::Complete);
    }

    fn operation_undo(&self) {
        self.finish(Completion::Undone);
    }

    fn set_exception(&self, error: TransactionError) {
        self.slot.lock().error = Some(error);
    }

    fn exception(&self) -> Option<TransactionError> {
        self.slot.lock().error.clone()
    }

    fn await_completion(&self) -> TxnResult<()> {
        let mut slot = self.slot.lock();
        while slot.completion.is_none() {
            self.signal.wait(&mut slot);
        }
        match &slot.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
