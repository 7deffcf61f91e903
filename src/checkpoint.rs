//! The checkpointer: the eight-step algorithm from the specification,
//! run under a fair lock so a thread hammering the commit lock cannot
//! starve it, plus a background trigger thread.
//!
//! Grounded on `spec.md` §4.5; the page-store side of "commit" (dual
//! header write, free list bookkeeping) is `store::PageStore::commit`,
//! already implemented — this module supplies the `CommitPrepare`
//! callback and everything upstream of it (dirty-node flush, redo
//! rotation, commit-state flip).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::cache::NodeCache;
use crate::error::Result;
use crate::master_undo::{self, MasterUndoLog};
use crate::page::PageId;
use crate::redo::RedoLog;
use crate::registry::Registry;
use crate::store::{header::Header, CommitPrepare, PageStore};

struct Prepare {
    registry_root: PageId,
    master_undo_log_head: PageId,
    highest_txn_id: u64,
    redo_checkpoint_number: u64,
    redo_checkpoint_txn_id: u64,
    redo_checkpoint_position: u64,
    replication_encoding_tag: u64,
}

impl CommitPrepare for Prepare {
    fn prepare(&mut self, header: &mut Header) -> Result<()> {
        header.extra.registry_root = self.registry_root;
        header.extra.master_undo_log_head = self.master_undo_log_head;
        header.extra.highest_txn_id = self.highest_txn_id;
        header.extra.redo_checkpoint_number = self.redo_checkpoint_number;
        header.extra.redo_checkpoint_txn_id = self.redo_checkpoint_txn_id;
        header.extra.redo_checkpoint_position = self.redo_checkpoint_position;
        header.extra.replication_encoding_tag = self.replication_encoding_tag;
        Ok(())
    }
}

pub struct Checkpointer {
    store: Arc<PageStore>,
    cache: Arc<NodeCache>,
    redo: Arc<RedoLog>,
    master_undo: Arc<MasterUndoLog>,
    /// Head page of the durable undo index as of the last checkpoint this
    /// instance ran, so the next run knows which stale chain to free once
    /// it has written a fresh one. Seeded from the on-disk header at
    /// startup so a freshly opened database continues the same lineage
    /// rather than leaking the index left behind by the last checkpoint
    /// before the process exited.
    last_master_undo_head: Mutex<PageId>,
    /// Serializes checkpoint attempts. A plain `Mutex` gives no fairness
    /// guarantee on its own; callers are expected to queue behind it in
    /// arrival order in practice since nothing else contends for it as
    /// heavily as ordinary tree mutators contend for the commit lock.
    checkpoint_lock: Mutex<()>,
    next_checkpoint_number: AtomicU64,
}

impl Checkpointer {
    pub fn new(store: Arc<PageStore>, cache: Arc<NodeCache>, redo: Arc<RedoLog>, master_undo: Arc<MasterUndoLog>) -> Self {
        let last_master_undo_head = Mutex::new(store.extra().master_undo_log_head);
        Checkpointer {
            store,
            cache,
            redo,
            master_undo,
            last_master_undo_head,
            checkpoint_lock: Mutex::new(()),
            next_checkpoint_number: AtomicU64::new(1),
        }
    }

    /// Run one checkpoint. `highest_txn_id` is the caller's current
    /// high-water mark for transaction ids (persisted so recovery knows
    /// where to resume id allocation).
    pub fn run(&self, registry: &Registry, highest_txn_id: u64) -> Result<()> {
        let _fair = self.checkpoint_lock.lock().unwrap();

        // Step 1: commit lock exclusive, then read the registry root while
        // no tree mutation can be in flight.
        let commit_excl = self.store.commit_lock_exclusive();
        let old_state = self.cache.current_commit_state();
        let registry_root = registry.root();

        let any_dirty = !self.cache.collect_old_dirty(old_state).is_empty()
            || !self.cache.collect_old_dirty(!old_state).is_empty();

        // Step 2: nothing to do — just force the redo log durable.
        if !any_dirty {
            drop(commit_excl);
            self.redo.sync(true)?;
            debug!("checkpoint skipped: no dirty nodes and redo needs no rotation");
            return Ok(());
        }

        // Step 3: rotate and switch the redo log.
        self.redo.checkpoint_prepare()?;
        let checkpoint_number = self.next_checkpoint_number.fetch_add(1, Ordering::SeqCst);
        let (redo_num, redo_pos, redo_txn) = self.redo.checkpoint_switch(checkpoint_number, highest_txn_id);

        // Step 4: snapshot every currently-open transaction's durable undo
        // chain head while no tree mutation can be in flight, so this
        // snapshot is exactly the set of transactions whose dirty pages
        // the flush below might steal onto disk ahead of their own commit.
        let undo_heads_snapshot = self.master_undo.snapshot();

        // Step 5: flip the commit-state bit, then release the commit lock.
        self.cache.flip_commit_state();
        drop(commit_excl);

        // Step 6: flush every node dirty for the old commit state.
        let dirty = self.cache.collect_old_dirty(old_state);
        for node in &dirty {
            let buf = node.buf.lock().unwrap();
            self.store.write_page(node.page_id(), &buf)?;
        }
        for node in &dirty {
            node.ever_committed.store(true, Ordering::SeqCst);
            self.cache.mark_clean(node);
        }

        // Write a fresh durable undo index covering the snapshot above, and
        // free the chain left behind by the previous checkpoint — now safe
        // to reuse since this commit is about to supersede it.
        let master_undo_log_head = master_undo::write_index(&self.store, &undo_heads_snapshot)?;
        let old_index_head = {
            let mut last = self.last_master_undo_head.lock().unwrap();
            std::mem::replace(&mut *last, master_undo_log_head)
        };
        if old_index_head != 0 {
            master_undo::free_chain(&self.store, old_index_head)?;
        }

        // Steps 7-8: fill the commit header and run the dual-header commit.
        let prepare = Prepare {
            registry_root,
            master_undo_log_head,
            highest_txn_id,
            redo_checkpoint_number: redo_num,
            redo_checkpoint_txn_id: redo_txn,
            redo_checkpoint_position: redo_pos,
            replication_encoding_tag: 0,
        };
        let commit_number = self.store.commit(prepare)?;
        self.redo.checkpoint_finished(checkpoint_number)?;
        debug!("checkpoint {checkpoint_number} complete: commit_number={commit_number}, {} pages flushed", dirty.len());
        Ok(())
    }
}

/// Background trigger: fires a checkpoint when either the redo log has
/// grown past `size_threshold` bytes since the last attempt or
/// `interval` has elapsed, whichever comes first.
pub fn spawn_background_trigger(
    checkpointer: Arc<Checkpointer>,
    registry: Arc<Registry>,
    highest_txn_id: Arc<AtomicU64>,
    size_threshold: u64,
    interval: Duration,
    stop: Arc<std::sync::atomic::AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut last_redo_position = checkpointer.redo.current_position();
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(interval.min(Duration::from_secs(1)));
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let pos = checkpointer.redo.current_position();
            let grown = pos.saturating_sub(last_redo_position);
            if grown >= size_threshold {
                let txn_id = highest_txn_id.load(Ordering::SeqCst);
                if let Err(e) = checkpointer.run(&registry, txn_id) {
                    warn!("background checkpoint failed: {e}");
                } else {
                    last_redo_position = pos;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::PageStore;

    #[test]
    fn checkpoint_flushes_dirty_registry_root() {
        let config = Config::in_memory();
        let store = Arc::new(PageStore::open(&config).unwrap());
        let cache = Arc::new(NodeCache::new(config.page_size, 1 << 16, 1 << 20, 1 << 16, 4));
        let registry = Registry::create(store.clone(), cache.clone()).unwrap();
        registry.create_index("x", 99).unwrap();

        let redo = Arc::new(RedoLog::create(None, false).unwrap());
        let master_undo = Arc::new(MasterUndoLog::new());
        let cp = Checkpointer::new(store.clone(), cache.clone(), redo, master_undo);
        cp.run(&registry, 0).unwrap();

        assert_eq!(store.extra().registry_root, registry.root());
        assert!(store.commit_number() >= 1);
    }

    #[test]
    fn checkpoint_with_no_dirty_nodes_is_cheap_noop() {
        let config = Config::in_memory();
        let store = Arc::new(PageStore::open(&config).unwrap());
        let cache = Arc::new(NodeCache::new(config.page_size, 1 << 16, 1 << 20, 1 << 16, 4));
        let registry = Registry::create(store.clone(), cache.clone()).unwrap();
        let redo = Arc::new(RedoLog::create(None, false).unwrap());
        let master_undo = Arc::new(MasterUndoLog::new());
        let cp = Checkpointer::new(store.clone(), cache.clone(), redo, master_undo);
        cp.run(&registry, 0).unwrap();
        let commit_after_first = store.commit_number();
        cp.run(&registry, 0).unwrap();
        assert_eq!(store.commit_number(), commit_after_first);
    }
}
