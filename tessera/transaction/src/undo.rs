//! Per-transaction undo log
//!
//! Every successful write appends one record holding the generation the key
//! pointed at before the write. Rollback replays records most-recent-first;
//! savepoints are plain indexes into the log.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::version::Generation;

/// A map the undo log can restore keys in.
///
/// The key is type-erased so one log can span maps of different key types.
pub(crate) trait UndoTarget: Send + Sync {
    fn map_name(&self) -> &str;

    /// Point `key` back at `previous` and drop the generation `written`.
    fn undo(&self, key: &(dyn Any + Send + Sync), previous: Option<Generation>, written: Generation);
}

pub(crate) struct UndoLogRecord {
    target: Arc<dyn UndoTarget>,
    key: Box<dyn Any + Send + Sync>,
    previous: Option<Generation>,
    written: Generation,
}

impl UndoLogRecord {
    pub(crate) fn new(
        target: Arc<dyn UndoTarget>,
        key: Box<dyn Any + Send + Sync>,
        previous: Option<Generation>,
        written: Generation,
    ) -> Self {
        Self {
            target,
            key,
            previous,
            written,
        }
    }

    pub(crate) fn map_name(&self) -> &str {
        self.target.map_name()
    }

    #[cfg(test)]
    pub(crate) fn written(&self) -> Generation {
        self.written
    }

    fn undo(&self) {
        self.target.undo(self.key.as_ref(), self.previous, self.written);
    }
}

impl fmt::Debug for UndoLogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoLogRecord")
            .field("map", &self.map_name())
            .field("previous", &self.previous)
            .field("written", &self.written)
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    records: Vec<UndoLogRecord>,
}

impl UndoLog {
    pub(crate) fn push(&mut self, record: UndoLogRecord) {
        self.records.push(record);
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Detach every record written at or after `index`.
    pub(crate) fn split_off(&mut self, index: usize) -> Vec<UndoLogRecord> {
        self.records.split_off(index.min(self.records.len()))
    }

    pub(crate) fn take(&mut self) -> Vec<UndoLogRecord> {
        std::mem::take(&mut self.records)
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &UndoLogRecord> {
        self.records.iter()
    }
}

/// Undo `records` most-recent-first.
pub(crate) fn replay(records: Vec<UndoLogRecord>) {
    for record in records.into_iter().rev() {
        record.undo();
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingTarget {
        undone: Mutex<Vec<(u32, Option<Generation>, Generation)>>,
    }

    impl UndoTarget for RecordingTarget {
        fn map_name(&self) -> &str {
            "recording"
        }

        fn undo(
            &self,
            key: &(dyn Any + Send + Sync),
            previous: Option<Generation>,
            written: Generation,
        ) {
            if let Some(key) = key.downcast_ref::<u32>() {
                self.undone.lock().push((*key, previous, written));
            }
        }
    }

    fn record(target: &Arc<RecordingTarget>, key: u32, written: u64) -> UndoLogRecord {
        UndoLogRecord::new(
            target.clone(),
            Box::new(key),
            written.checked_sub(1).map(Generation::new),
            Generation::new(written),
        )
    }

    #[test]
    fn test_replay_is_most_recent_first() {
        let target = Arc::new(RecordingTarget::default());
        let mut log = UndoLog::default();
        log.push(record(&target, 1, 1));
        log.push(record(&target, 2, 2));
        log.push(record(&target, 1, 3));
        assert_eq!(log.len(), 3);

        replay(log.take());
        assert!(log.is_empty());

        let undone = target.undone.lock();
        let written: Vec<_> = undone.iter().map(|(_, _, w)| w.raw()).collect();
        assert_eq!(written, vec![3, 2, 1]);
        assert_eq!(undone[2], (1, Some(Generation::new(0)), Generation::new(1)));
    }

    #[test]
    fn test_split_off_keeps_prefix() {
        let target = Arc::new(RecordingTarget::default());
        let mut log = UndoLog::default();
        for i in 1..=4 {
            log.push(record(&target, i, i as u64));
        }

        let suffix = log.split_off(2);
        assert_eq!(suffix.len(), 2);
        assert_eq!(log.len(), 2);
        assert_eq!(
            log.iter().map(|r| r.written().raw()).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(log.iter().next().map(|r| r.map_name()), Some("recording"));

        // Out-of-range savepoint index detaches nothing.
        assert!(log.split_off(10).is_empty());
        assert_eq!(log.len(), 2);
    }
}
