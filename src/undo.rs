//! Per-transaction undo log: the record list a rollback replays in
//! reverse to undo everything a transaction (or one of its scopes) did.
//!
//! Grounded on the free list's "chain of records" idiom
//! ([`crate::store::freelist::FreeList`]) for the record shape, but kept
//! resident in memory per transaction rather than paged to disk: the
//! crash-durability half of undo (surviving a process crash mid-transaction)
//! is covered by the redo log replaying nothing past the last committed
//! record and simply discarding anything uncommitted, so an in-process
//! buffer is sufficient for rollback triggered by `exit`/`reset` during a
//! live transaction. Recorded as an Open Question resolution in DESIGN.md.

use crate::error::Result;

#[derive(Debug, Clone)]
pub enum UndoRecord {
    ScopeEnter,
    /// A fresh key was inserted; undo is `delete(tree_id, key)`.
    Insert { tree_id: u64, key: Vec<u8> },
    /// An existing key's value was replaced; undo restores the old value.
    UpdateValue {
        tree_id: u64,
        key: Vec<u8>,
        old_value: Vec<u8>,
        old_fragmented: bool,
    },
    /// A key was removed; undo re-inserts it.
    Delete {
        tree_id: u64,
        key: Vec<u8>,
        old_value: Vec<u8>,
        old_fragmented: bool,
    },
    /// A large value's fragment descriptor was orphaned by a delete or
    /// overwrite; kept here until the transaction that deleted it commits
    /// for good, at which point it is handed off to the background drain.
    /// Carries the encoded descriptor itself (not just a page id) since a
    /// direct-layout value has no single root to point to.
    TrashRef { descriptor: Vec<u8> },
    Custom(Vec<u8>),
}

/// Anything capable of applying an undo record against live tree state.
pub trait UndoSink {
    fn apply(&self, record: &UndoRecord) -> Result<()>;
}

pub struct UndoLog {
    records: Vec<UndoRecord>,
    /// Index into `records` of each open scope's start.
    scope_starts: Vec<usize>,
}

impl UndoLog {
    pub fn new() -> Self {
        UndoLog { records: Vec::new(), scope_starts: vec![0] }
    }

    pub fn push(&mut self, record: UndoRecord) {
        self.records.push(record);
    }

    pub fn enter_scope(&mut self) {
        self.scope_starts.push(self.records.len());
    }

    /// Drop the top scope's boundary without discarding its records — they
    /// merge into the parent scope, as `commit()` on a scope means "this
    /// much work survives if an enclosing scope later rolls back further
    /// up, but is itself done".
    pub fn commit_scope(&mut self) {
        if self.scope_starts.len() > 1 {
            self.scope_starts.pop();
        }
    }

    /// Roll back everything recorded since the top scope began, in reverse
    /// order, then drop that scope.
    pub fn rollback_scope(&mut self, sink: &dyn UndoSink) -> Result<()> {
        let start = if self.scope_starts.len() > 1 {
            self.scope_starts.pop().unwrap()
        } else {
            *self.scope_starts.first().unwrap_or(&0)
        };
        self.rollback_from(start, sink)
    }

    /// Roll back every scope (used by `reset()`).
    pub fn rollback_all(&mut self, sink: &dyn UndoSink) -> Result<()> {
        self.rollback_from(0, sink)?;
        self.scope_starts = vec![0];
        Ok(())
    }

    fn rollback_from(&mut self, start: usize, sink: &dyn UndoSink) -> Result<()> {
        while self.records.len() > start {
            let record = self.records.pop().unwrap();
            sink.apply(&record)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn scope_depth(&self) -> usize {
        self.scope_starts.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Trash references accumulated so far, drained once the owning
    /// transaction commits for good (they must NOT be freed on a plain
    /// scope commit, since an outer scope might still roll back over them).
    pub fn trash_refs(&self) -> Vec<Vec<u8>> {
        self.records
            .iter()
            .filter_map(|r| match r {
                UndoRecord::TrashRef { descriptor } => Some(descriptor.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);
    impl UndoSink for Recorder {
        fn apply(&self, record: &UndoRecord) -> Result<()> {
            self.0.lock().unwrap().push(format!("{record:?}"));
            Ok(())
        }
    }

    #[test]
    fn scope_rollback_reverses_order() {
        let mut log = UndoLog::new();
        log.push(UndoRecord::Insert { tree_id: 1, key: b"a".to_vec() });
        log.enter_scope();
        log.push(UndoRecord::Insert { tree_id: 1, key: b"b".to_vec() });
        log.push(UndoRecord::Insert { tree_id: 1, key: b"c".to_vec() });

        let sink = Recorder(Mutex::new(Vec::new()));
        log.rollback_scope(&sink).unwrap();
        let seen = sink.0.into_inner().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("\"c\""));
        assert!(seen[1].contains("\"b\""));
        assert_eq!(log.len(), 1); // the outer insert of "a" survives
    }

    #[test]
    fn reset_rolls_back_every_scope() {
        let mut log = UndoLog::new();
        log.push(UndoRecord::Insert { tree_id: 1, key: b"a".to_vec() });
        log.enter_scope();
        log.push(UndoRecord::Insert { tree_id: 1, key: b"b".to_vec() });

        let sink = Recorder(Mutex::new(Vec::new()));
        log.rollback_all(&sink).unwrap();
        assert!(log.is_empty());
    }
}
