//! A single transaction: id, durability mode, lock timeout/mode, and the
//! scope stack that drives the undo log.
//!
//! Grounded on `spec.md` §4.4; lock bookkeeping delegates to
//! [`crate::lock::LockManager`], rollback delegates to
//! [`crate::undo::UndoLog`]. A transaction doesn't know how to apply undo
//! records itself — it is handed an [`UndoSink`] (the `Database`'s tree
//! table) at rollback time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{DurabilityMode, LockTimeout, LockUpgradeRule};
use crate::error::Result;
use crate::lock::{LockManager, LockMode, LockResult};
use crate::master_undo::{DurableUndoOp, MasterUndoLog};
use crate::store::PageStore;
use crate::undo::{UndoLog, UndoRecord, UndoSink};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_txn_id() -> u64 {
    NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst)
}

/// Resume id allocation above `at_least`, used by recovery once the
/// persisted high-water mark (and anything seen during redo replay) is
/// known.
pub fn bump_next_txn_id(at_least: u64) {
    NEXT_TXN_ID.fetch_max(at_least, Ordering::SeqCst);
}

pub struct Transaction {
    id: u64,
    durability: DurabilityMode,
    lock_timeout: Mutex<LockTimeout>,
    /// Mode automatic locking falls back to for operations that don't name
    /// one explicitly (e.g. a plain `load`); defaults to `Upgradable` so a
    /// read can be promoted to a write later in the same transaction
    /// without contending with itself.
    lock_mode: Mutex<LockMode>,
    locks: Arc<LockManager>,
    held: Mutex<Vec<(u64, Vec<u8>)>>,
    undo: Mutex<UndoLog>,
    store: Arc<PageStore>,
    master_undo: Arc<MasterUndoLog>,
}

impl Transaction {
    pub fn new(
        locks: Arc<LockManager>,
        durability: DurabilityMode,
        lock_timeout: LockTimeout,
        store: Arc<PageStore>,
        master_undo: Arc<MasterUndoLog>,
    ) -> Self {
        Transaction {
            id: next_txn_id(),
            durability,
            lock_timeout: Mutex::new(lock_timeout),
            lock_mode: Mutex::new(LockMode::Upgradable),
            locks,
            held: Mutex::new(Vec::new()),
            undo: Mutex::new(UndoLog::new()),
            store,
            master_undo,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability
    }

    pub fn lock_timeout(&self) -> LockTimeout {
        *self.lock_timeout.lock().unwrap()
    }

    pub fn set_lock_timeout(&self, timeout: LockTimeout) {
        *self.lock_timeout.lock().unwrap() = timeout;
    }

    pub fn lock_mode(&self) -> LockMode {
        *self.lock_mode.lock().unwrap()
    }

    pub fn set_lock_mode(&self, mode: LockMode) {
        *self.lock_mode.lock().unwrap() = mode;
    }

    fn lock(&self, tree_id: u64, key: &[u8], mode: LockMode) -> LockResult {
        let deadline = LockManager::lock_timeout_to_deadline(self.lock_timeout());
        let result = self.locks.lock(self.id, tree_id, key, mode, deadline);
        if result.acquired {
            self.held.lock().unwrap().push((tree_id, key.to_vec()));
        }
        result
    }

    pub fn lock_shared(&self, tree_id: u64, key: &[u8]) -> LockResult {
        self.lock(tree_id, key, LockMode::Shared)
    }

    pub fn lock_upgradable(&self, tree_id: u64, key: &[u8]) -> LockResult {
        self.lock(tree_id, key, LockMode::Upgradable)
    }

    pub fn lock_exclusive(&self, tree_id: u64, key: &[u8]) -> LockResult {
        self.lock(tree_id, key, LockMode::Exclusive)
    }

    /// Wake this transaction out of any lock wait another thread has it
    /// blocked in, with [`LockResult::interrupted`] set on the waiter's
    /// return value. Meant to be called from a thread other than the one
    /// blocked in `lock()`.
    pub fn interrupt(&self) {
        self.locks.interrupt(self.id);
    }

    /// Record one undo step, durably first if it's one of the variants
    /// crash recovery needs to replay (see [`crate::master_undo`]) — it
    /// must complete before the corresponding tree mutation's own dirty
    /// marking starts, so a concurrent checkpoint can never flush that
    /// mutation's page without this record already being visible to it.
    /// Callers rely on this by always calling `push_undo` before the
    /// matching `Tree::insert`/`delete`/`Cursor::store`/`delete` call.
    pub fn push_undo(&self, record: UndoRecord) -> Result<()> {
        if let Some(op) = durable_op_for(&record) {
            self.master_undo.push(&self.store, self.id, &op)?;
        }
        self.undo.lock().unwrap().push(record);
        Ok(())
    }

    /// Drop this transaction's durable undo chain and free its pages.
    /// Called once the transaction is durably committed or has fully
    /// rolled back, so recovery never needs to consider it again.
    pub fn forget_durable(&self) -> Result<()> {
        self.master_undo.forget(&self.store, self.id)
    }

    pub fn trash_refs(&self) -> Vec<Vec<u8>> {
        self.undo.lock().unwrap().trash_refs()
    }

    /// How many scopes deep the transaction currently is; 1 means "no
    /// nested scope has been entered", i.e. the outermost scope.
    pub fn scope_depth(&self) -> usize {
        self.undo.lock().unwrap().scope_depth()
    }

    /// Push a new scope, e.g. for a nested operation that might need to be
    /// rolled back independently of the rest of the transaction.
    pub fn enter(&self) {
        self.undo.lock().unwrap().enter_scope();
    }

    /// Commit the top scope: its undo records merge into the parent scope
    /// rather than being discarded (they still roll back if an enclosing
    /// scope resets), and locks acquired in it are retained.
    pub fn commit(&self) {
        self.undo.lock().unwrap().commit_scope();
    }

    /// Roll back only the top scope.
    pub fn exit(&self, sink: &dyn UndoSink) -> Result<()> {
        self.undo.lock().unwrap().rollback_scope(sink)
    }

    /// Roll back every scope and release every lock this transaction holds.
    pub fn reset(&self, sink: &dyn UndoSink) -> Result<()> {
        self.undo.lock().unwrap().rollback_all(sink)?;
        self.release_all();
        Ok(())
    }

    /// Release every held lock without touching the undo log — used once a
    /// transaction's work is fully committed and durable.
    pub fn release_all(&self) {
        let held = std::mem::take(&mut *self.held.lock().unwrap());
        let mut by_tree: std::collections::HashMap<u64, Vec<Vec<u8>>> = std::collections::HashMap::new();
        for (tree_id, key) in held {
            by_tree.entry(tree_id).or_default().push(key);
        }
        for (tree_id, keys) in by_tree {
            self.locks.unlock_all(self.id, tree_id, keys);
        }
    }
}

/// `ScopeEnter`/`TrashRef`/`Custom` need no durable counterpart: crash
/// recovery only ever undoes a whole in-flight transaction, never a
/// sub-scope, and orphaned fragment pages are a lesser concern than tree
/// data correctness.
fn durable_op_for(record: &UndoRecord) -> Option<DurableUndoOp> {
    match record {
        UndoRecord::Insert { tree_id, key } => Some(DurableUndoOp::Delete { tree_id: *tree_id, key: key.clone() }),
        UndoRecord::UpdateValue { tree_id, key, old_value, old_fragmented }
        | UndoRecord::Delete { tree_id, key, old_value, old_fragmented } => Some(DurableUndoOp::Store {
            tree_id: *tree_id,
            key: key.clone(),
            old_value: old_value.clone(),
            old_fragmented: *old_fragmented,
        }),
        UndoRecord::ScopeEnter | UndoRecord::TrashRef { .. } | UndoRecord::Custom(_) => None,
    }
}

pub fn default_lock_timeout_for(rule: LockUpgradeRule) -> LockTimeout {
    let _ = rule; // upgrade rule does not affect the default timeout; kept for symmetry with Config
    LockTimeout::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LockUpgradeRule};
    use crate::store::PageStore;
    use std::sync::Mutex as StdMutex;

    struct NoopSink(StdMutex<Vec<UndoRecord>>);
    impl UndoSink for NoopSink {
        fn apply(&self, record: &UndoRecord) -> Result<()> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn test_store() -> Arc<PageStore> {
        Arc::new(PageStore::open(&Config::in_memory()).unwrap())
    }

    #[test]
    fn reset_releases_locks_and_rolls_back() {
        let locks = Arc::new(LockManager::new(4, LockUpgradeRule::Strict, 64));
        let store = test_store();
        let master_undo = Arc::new(MasterUndoLog::new());
        let txn = Transaction::new(locks.clone(), DurabilityMode::Sync, LockTimeout::NonBlocking, store.clone(), master_undo.clone());
        assert!(txn.lock_exclusive(1, b"k").acquired);
        txn.push_undo(UndoRecord::Insert { tree_id: 1, key: b"k".to_vec() }).unwrap();

        let sink = NoopSink(StdMutex::new(Vec::new()));
        txn.reset(&sink).unwrap();
        assert_eq!(sink.0.into_inner().unwrap().len(), 1);

        // Lock should now be free for another transaction.
        let txn2 = Transaction::new(locks, DurabilityMode::Sync, LockTimeout::NonBlocking, store, master_undo);
        assert!(txn2.lock_exclusive(1, b"k").acquired);
    }
}
