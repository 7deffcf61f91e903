//! `wyrmkv` — an embeddable, transactional, ordered key-value storage
//! engine: a copy-on-write B+tree over a page store, a redo log for
//! crash recovery, an in-process undo log for rollback, shared/upgradable/
//! exclusive locking with deadlock detection, checkpointing, and
//! fragmented storage for values too large to fit in a page.
//!
//! This module wires the lower layers (`store`, `cache`, `btree`,
//! `registry`, `lock`, `undo`, `txn`, `redo`, `checkpoint`, `fragval`,
//! `gc`) into the public `Database` / `Index` / `Cursor` / `Transaction`
//! surface.

pub mod btree;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fragval;
pub mod gc;
pub mod lock;
pub mod master_undo;
pub mod page;
pub mod redo;
pub mod registry;
mod replay;
pub mod store;
pub mod txn;
pub mod undo;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::time::Duration;

use log::warn;

use btree::{Cursor as TreeCursor, Tree};
use cache::NodeCache;
pub use config::{Config, DurabilityMode, LockTimeout, LockUpgradeRule};
pub use error::{Error, Result};
pub use lock::{LockMode, LockResult};
use registry::Registry;
use store::PageStore;
use undo::{UndoRecord, UndoSink};

struct Inner {
    store: Arc<PageStore>,
    cache: Arc<NodeCache>,
    registry: Arc<Registry>,
    locks: Arc<lock::LockManager>,
    redo: Arc<redo::RedoLog>,
    checkpointer: Arc<checkpoint::Checkpointer>,
    master_undo: Arc<master_undo::MasterUndoLog>,
    frag_trash: Arc<fragval::trash::TrashQueue>,
    highest_txn_id: Arc<AtomicU64>,
    open_trees: RwLock<HashMap<u64, Arc<Tree>>>,
    config: Config,
    gc_tx: mpsc::Sender<gc::Command>,
}

impl Inner {
    fn tree_handle(&self, id: u64) -> Result<Arc<Tree>> {
        if let Some(tree) = self.open_trees.read().unwrap().get(&id).cloned() {
            return Ok(tree);
        }
        let (root, _name) = self
            .registry
            .root_and_name_by_id(id)?
            .ok_or_else(|| Error::InvalidArgument(format!("no index with id {id}")))?;
        let tree = Arc::new(Tree::open(self.store.clone(), self.cache.clone(), root));
        self.open_trees.write().unwrap().insert(id, tree.clone());
        Ok(tree)
    }
}

/// Applies undo records against the tree they originated in. `TrashRef`
/// and `Custom` are no-ops here: the orphaned fragment pages they
/// reference are only ever discarded once the owning transaction commits
/// for good (see [`Transaction::commit`]), never on rollback.
struct DbUndoSink<'a> {
    inner: &'a Inner,
}

impl UndoSink for DbUndoSink<'_> {
    fn apply(&self, record: &UndoRecord) -> Result<()> {
        match record {
            UndoRecord::ScopeEnter | UndoRecord::TrashRef { .. } | UndoRecord::Custom(_) => Ok(()),
            UndoRecord::Insert { tree_id, key } => {
                if let Some(tree) = self.inner.open_trees.read().unwrap().get(tree_id) {
                    tree.delete(key)?;
                }
                Ok(())
            }
            UndoRecord::UpdateValue { tree_id, key, old_value, old_fragmented }
            | UndoRecord::Delete { tree_id, key, old_value, old_fragmented } => {
                if let Some(tree) = self.inner.open_trees.read().unwrap().get(tree_id) {
                    tree.insert(key, old_value, *old_fragmented)?;
                }
                Ok(())
            }
        }
    }
}

fn acquire_lock(txn: &txn::Transaction, mode: LockMode, tree_id: u64, key: &[u8]) -> Result<()> {
    let result = match mode {
        LockMode::Shared => txn.lock_shared(tree_id, key),
        LockMode::Upgradable => txn.lock_upgradable(tree_id, key),
        LockMode::Exclusive => txn.lock_exclusive(tree_id, key),
    };
    if result.acquired {
        Ok(())
    } else {
        Err(Error::LockFailed(result))
    }
}

fn acquire_read_lock(txn: &txn::Transaction, tree_id: u64, key: &[u8]) -> Result<()> {
    acquire_lock(txn, txn.lock_mode(), tree_id, key)
}

fn acquire_write_lock(txn: &txn::Transaction, tree_id: u64, key: &[u8]) -> Result<()> {
    acquire_lock(txn, LockMode::Exclusive, tree_id, key)
}

/// Encode `value` as a fragmented descriptor if it's too large to keep
/// inline in a leaf entry; otherwise return it unchanged.
fn prepare_value(inner: &Inner, value: &[u8]) -> Result<(Vec<u8>, bool)> {
    if fragval::value::needs_fragmentation(inner.store.page_size(), value.len()) {
        // Held for the duration of the fragment write alone: it dirties
        // inode/fragment pages directly, outside of any `Tree::insert`
        // call, so it needs its own fencing against checkpoint.
        let _commit_guard = inner.store.commit_lock_shared();
        let encoded = fragval::value::write(&inner.store, &inner.cache, None, 0, value)?;
        Ok((encoded, true))
    } else {
        Ok((value.to_vec(), false))
    }
}

/// Read the full logical value out of whatever leaf representation it's
/// stored in (inline bytes, or a fragment descriptor).
fn materialize(inner: &Inner, bytes: &[u8], fragmented: bool) -> Result<Vec<u8>> {
    if !fragmented {
        return Ok(bytes.to_vec());
    }
    let len = fragval::value::length(bytes)?;
    let mut out = vec![0u8; len as usize];
    if len > 0 {
        fragval::value::read(&inner.store, &inner.cache, bytes, 0, &mut out)?;
    }
    Ok(out)
}

/// A fragmented descriptor of `bytes`, promoting it from inline form
/// first if needed.
fn ensure_fragment_base(inner: &Inner, bytes: &[u8], fragmented: bool) -> Result<Vec<u8>> {
    if fragmented {
        return Ok(bytes.to_vec());
    }
    let _commit_guard = inner.store.commit_lock_shared();
    fragval::value::write(&inner.store, &inner.cache, None, 0, bytes)
}

/// A database handle: the page store, node cache, index registry, lock
/// manager, redo log and checkpointer, plus the background threads that
/// drive garbage collection and periodic checkpoints.
pub struct Database {
    inner: Arc<Inner>,
    gc_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    checkpoint_stop: Arc<AtomicBool>,
    checkpoint_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    flush_zone_stop: Arc<AtomicBool>,
    flush_zone_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Database {
    /// Open (or create) a database per `config`, replaying any redo
    /// records written since the last checkpoint and then performing one
    /// checkpoint to durably discard them.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(PageStore::open(&config)?);
        let worker_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let cache = Arc::new(NodeCache::new(
            config.page_size,
            config.min_cached_bytes,
            config.max_cached_bytes,
            config.flush_threshold_bytes,
            config.frag_shard_count(),
        ));

        let extra = store.extra();
        let registry = if extra.registry_root == 0 {
            Registry::create(store.clone(), cache.clone())?
        } else {
            Registry::open(store.clone(), cache.clone(), extra.registry_root)
        };

        let redo_enabled = config.durability_mode != DurabilityMode::NoRedo;
        let redo = Arc::new(redo::RedoLog::create(config.data_path().as_deref(), redo_enabled)?);

        let open_trees: RwLock<HashMap<u64, Arc<Tree>>> = RwLock::new(HashMap::new());
        let highest_txn_id = Arc::new(AtomicU64::new(extra.highest_txn_id));
        let master_undo = Arc::new(master_undo::MasterUndoLog::new());

        if redo_enabled {
            let records = redo.replay(extra.redo_checkpoint_number)?;
            let terminal_txns = if !records.is_empty() {
                replay::replay(records, &store, &cache, &registry, &open_trees, &highest_txn_id, worker_count)?
            } else {
                std::collections::HashSet::new()
            };
            // Undo anything durably recorded as of the last checkpoint
            // whose owning transaction didn't reach a final commit or
            // rollback marker before the crash — including the case where
            // the redo stream since that checkpoint is itself empty, which
            // still leaves those transactions unresolved.
            master_undo::recover(&store, &cache, &registry, &open_trees, extra.master_undo_log_head, &terminal_txns)?;
        }
        txn::bump_next_txn_id(highest_txn_id.load(Ordering::SeqCst) + 1);

        let registry = Arc::new(registry);
        let checkpointer = Arc::new(checkpoint::Checkpointer::new(
            store.clone(),
            cache.clone(),
            redo.clone(),
            master_undo.clone(),
        ));
        // Discard whatever redo was just replayed, and start clean either way.
        checkpointer.run(&registry, highest_txn_id.load(Ordering::SeqCst))?;

        let frag_trash = Arc::new(fragval::trash::TrashQueue::new());
        let _ = gc::sweep(&store, &cache, &registry)?;
        let (gc_tx, gc_handle) = gc::spawn_worker(
            store.clone(),
            cache.clone(),
            registry.clone(),
            frag_trash.clone(),
            Duration::from_secs(5),
        );

        let locks = Arc::new(lock::LockManager::new(
            config.frag_shard_count(),
            config.lock_upgrade_rule,
            config.deadlock_scan_limit,
        ));

        let checkpoint_stop = Arc::new(AtomicBool::new(false));
        let checkpoint_handle = checkpoint::spawn_background_trigger(
            checkpointer.clone(),
            registry.clone(),
            highest_txn_id.clone(),
            config.checkpoint_size_threshold,
            config.checkpoint_interval,
            checkpoint_stop.clone(),
        );

        let flush_zone_stop = Arc::new(AtomicBool::new(false));
        let flush_zone_handle =
            cache::spawn_flush_zone_worker(cache.clone(), store.clone(), Duration::from_secs(2), flush_zone_stop.clone());

        let inner = Arc::new(Inner {
            store,
            cache,
            registry,
            locks,
            redo,
            checkpointer,
            master_undo,
            frag_trash,
            highest_txn_id,
            open_trees,
            config,
            gc_tx,
        });

        Ok(Database {
            inner,
            gc_handle: Mutex::new(Some(gc_handle)),
            checkpoint_stop,
            checkpoint_handle: Mutex::new(Some(checkpoint_handle)),
            flush_zone_stop,
            flush_zone_handle: Mutex::new(Some(flush_zone_handle)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ClosedDatabase { cause: "database was closed".into() });
        }
        Ok(())
    }

    fn index_handle(&self, id: u64) -> Result<Index> {
        let tree = self.inner.tree_handle(id)?;
        Ok(Index { inner: self.inner.clone(), id, tree })
    }

    /// Look up an existing index by name.
    pub fn find_index(&self, name: &str) -> Result<Option<Index>> {
        self.ensure_open()?;
        match self.inner.registry.find_by_name(name)? {
            Some(id) => Ok(Some(self.index_handle(id)?)),
            None => Ok(None),
        }
    }

    /// Look up an existing index by name, creating it if absent.
    pub fn open_index(&self, name: &str) -> Result<Index> {
        self.ensure_open()?;
        if let Some(existing) = self.find_index(name)? {
            return Ok(existing);
        }
        let tree = Arc::new(Tree::create(self.inner.store.clone(), self.inner.cache.clone())?);
        let id = self.inner.registry.create_index(name, tree.root())?;
        self.inner.open_trees.write().unwrap().insert(id, tree.clone());
        Ok(Index { inner: self.inner.clone(), id, tree })
    }

    /// Look up an existing index by its numeric id.
    pub fn index_by_id(&self, id: u64) -> Result<Option<Index>> {
        self.ensure_open()?;
        if self.inner.registry.root_and_name_by_id(id)?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.index_handle(id)?))
    }

    pub fn rename_index(&self, index: &Index, new_name: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.registry.rename(index.id, new_name)
    }

    /// Mark an index for deletion; its pages are reclaimed in the
    /// background by the garbage collector.
    pub fn delete_index(&self, index: Index) -> Result<()> {
        self.ensure_open()?;
        self.inner.registry.mark_trash(index.id)?;
        self.inner.open_trees.write().unwrap().remove(&index.id);
        let _ = self.inner.gc_tx.send(gc::Command::Sweep);
        Ok(())
    }

    /// Start a new transaction with the database's default durability
    /// mode and lock timeout.
    pub fn new_transaction(&self) -> Transaction {
        self.new_transaction_with(self.inner.config.durability_mode, self.inner.config.lock_timeout)
    }

    pub fn new_transaction_with(&self, durability: DurabilityMode, lock_timeout: LockTimeout) -> Transaction {
        Transaction {
            inner: self.inner.clone(),
            txn: txn::Transaction::new(
                self.inner.locks.clone(),
                durability,
                lock_timeout,
                self.inner.store.clone(),
                self.inner.master_undo.clone(),
            ),
        }
    }

    /// Force a checkpoint now, regardless of the background trigger's schedule.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .checkpointer
            .run(&self.inner.registry, self.inner.highest_txn_id.load(Ordering::SeqCst))
    }

    /// Flush buffered redo bytes without forcing them to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.redo.flush()
    }

    /// Force the redo log and the page store to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.redo.sync(true)?;
        self.inner.store.sync(true)
    }

    /// Stop background workers, run a final checkpoint, and close the
    /// backing store. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.checkpoint_stop.store(true, Ordering::SeqCst);
        self.flush_zone_stop.store(true, Ordering::SeqCst);
        let _ = self.inner.gc_tx.send(gc::Command::Stop);
        if let Some(handle) = self.gc_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.checkpoint_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.flush_zone_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.inner
            .checkpointer
            .run(&self.inner.registry, self.inner.highest_txn_id.load(Ordering::SeqCst))?;
        self.inner.store.close()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                warn!("error closing database on drop: {e}");
            }
        }
    }
}

/// A handle to one ordered key-value index (a B+tree). Cheap to clone —
/// every clone shares the same underlying tree.
#[derive(Clone)]
pub struct Index {
    inner: Arc<Inner>,
    id: u64,
    tree: Arc<Tree>,
}

impl Index {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn log_value(&self, txn: &Transaction, key: &[u8], encoded: Option<(&[u8], bool)>) -> Result<()> {
        let payload = match encoded {
            Some((value, fragmented)) => replay::encode_store(self.id, key, value, fragmented),
            None => replay::encode_delete(self.id, key),
        };
        self.inner.redo.append(redo::RedoOp::TxnStore, Some(txn.txn.id()), &payload)?;
        Ok(())
    }

    /// Unconditional read.
    pub fn load(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>> {
        acquire_read_lock(&txn.txn, self.id, key)?;
        match self.tree.get(key)? {
            Some((bytes, fragmented)) => Ok(Some(materialize(&self.inner, &bytes, fragmented)?)),
            None => Ok(None),
        }
    }

    /// Unconditional upsert.
    pub fn store(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        acquire_write_lock(&txn.txn, self.id, key)?;
        let old = self.tree.get(key)?;
        let (encoded, fragmented) = prepare_value(&self.inner, value)?;
        // Push undo before the tree mutation: see `txn::Transaction::push_undo`.
        match &old {
            Some((old_bytes, old_fragmented)) => {
                if *old_fragmented {
                    txn.txn.push_undo(UndoRecord::TrashRef { descriptor: old_bytes.clone() })?;
                }
                txn.txn.push_undo(UndoRecord::UpdateValue {
                    tree_id: self.id,
                    key: key.to_vec(),
                    old_value: old_bytes.clone(),
                    old_fragmented: *old_fragmented,
                })?;
            }
            None => txn.txn.push_undo(UndoRecord::Insert { tree_id: self.id, key: key.to_vec() })?,
        }
        self.tree.insert(key, &encoded, fragmented)?;
        self.log_value(txn, key, Some((&encoded, fragmented)))
    }

    /// Insert only if `key` is absent. Returns whether it was inserted.
    pub fn insert(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<bool> {
        acquire_write_lock(&txn.txn, self.id, key)?;
        if self.tree.get(key)?.is_some() {
            return Ok(false);
        }
        let (encoded, fragmented) = prepare_value(&self.inner, value)?;
        txn.txn.push_undo(UndoRecord::Insert { tree_id: self.id, key: key.to_vec() })?;
        self.tree.insert(key, &encoded, fragmented)?;
        self.log_value(txn, key, Some((&encoded, fragmented)))?;
        Ok(true)
    }

    /// Replace only if `key` is present. Returns whether it existed.
    pub fn replace(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<bool> {
        acquire_write_lock(&txn.txn, self.id, key)?;
        let Some((old_bytes, old_fragmented)) = self.tree.get(key)? else {
            return Ok(false);
        };
        let (encoded, fragmented) = prepare_value(&self.inner, value)?;
        if old_fragmented {
            txn.txn.push_undo(UndoRecord::TrashRef { descriptor: old_bytes.clone() })?;
        }
        txn.txn.push_undo(UndoRecord::UpdateValue {
            tree_id: self.id,
            key: key.to_vec(),
            old_value: old_bytes,
            old_fragmented,
        })?;
        self.tree.insert(key, &encoded, fragmented)?;
        self.log_value(txn, key, Some((&encoded, fragmented)))?;
        Ok(true)
    }

    /// Unconditional upsert, returning the previous value if any.
    pub fn exchange(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        acquire_write_lock(&txn.txn, self.id, key)?;
        let old = self.tree.get(key)?;
        let (encoded, fragmented) = prepare_value(&self.inner, value)?;
        let result = match old {
            Some((old_bytes, old_fragmented)) => {
                let materialized = materialize(&self.inner, &old_bytes, old_fragmented)?;
                if old_fragmented {
                    txn.txn.push_undo(UndoRecord::TrashRef { descriptor: old_bytes.clone() })?;
                }
                txn.txn.push_undo(UndoRecord::UpdateValue {
                    tree_id: self.id,
                    key: key.to_vec(),
                    old_value: old_bytes,
                    old_fragmented,
                })?;
                Some(materialized)
            }
            None => {
                txn.txn.push_undo(UndoRecord::Insert { tree_id: self.id, key: key.to_vec() })?;
                None
            }
        };
        self.tree.insert(key, &encoded, fragmented)?;
        self.log_value(txn, key, Some((&encoded, fragmented)))?;
        Ok(result)
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> Result<bool> {
        acquire_write_lock(&txn.txn, self.id, key)?;
        let Some((old_bytes, old_fragmented)) = self.tree.get(key)? else {
            return Ok(false);
        };
        if old_fragmented {
            txn.txn.push_undo(UndoRecord::TrashRef { descriptor: old_bytes.clone() })?;
        }
        txn.txn.push_undo(UndoRecord::Delete {
            tree_id: self.id,
            key: key.to_vec(),
            old_value: old_bytes,
            old_fragmented,
        })?;
        self.tree.delete(key)?;
        self.log_value(txn, key, None)?;
        Ok(true)
    }

    /// Open a cursor over this index, bound to `txn` for the locks and
    /// undo records its operations produce.
    pub fn new_cursor<'t>(&'t self, txn: &'t Transaction) -> Cursor<'t> {
        Cursor {
            inner: self.inner.clone(),
            tree_id: self.id,
            txn,
            cursor: TreeCursor::new(&self.tree),
        }
    }
}

/// A movable position over an [`Index`], with direct access to the value
/// at that position (including partial reads/writes of fragmented
/// values without materializing the whole thing).
pub struct Cursor<'t> {
    inner: Arc<Inner>,
    tree_id: u64,
    txn: &'t Transaction,
    cursor: TreeCursor<'t>,
}

impl<'t> Cursor<'t> {
    fn current_key(&self) -> Result<Vec<u8>> {
        self.cursor.key().map(<[u8]>::to_vec).ok_or(Error::UnpositionedCursor)
    }

    fn log_value(&self, key: &[u8], encoded: Option<(&[u8], bool)>) -> Result<()> {
        let payload = match encoded {
            Some((value, fragmented)) => replay::encode_store(self.tree_id, key, value, fragmented),
            None => replay::encode_delete(self.tree_id, key),
        };
        self.inner.redo.append(redo::RedoOp::CursorStore, Some(self.txn.txn.id()), &payload)?;
        Ok(())
    }

    /// Read the key's current value straight from the tree, bypassing
    /// `btree::Cursor::load`'s quirk of reporting `UnpositionedCursor`
    /// whenever the key was concurrently removed even though the cursor
    /// still believes itself positioned.
    fn tree_load(&self, key: &[u8]) -> Result<(Vec<u8>, bool)> {
        self.inner.tree_handle(self.tree_id)?.get(key)?.ok_or(Error::UnpositionedCursor)
    }

    pub fn first(&mut self) -> Result<()> {
        self.cursor.first()
    }

    pub fn last(&mut self) -> Result<()> {
        self.cursor.last()
    }

    pub fn next(&mut self) -> Result<()> {
        self.cursor.next()
    }

    pub fn previous(&mut self) -> Result<()> {
        self.cursor.previous()
    }

    pub fn find(&mut self, key: &[u8]) -> Result<()> {
        self.cursor.find(key)
    }

    pub fn find_ge(&mut self, key: &[u8]) -> Result<()> {
        self.cursor.find_ge(key)
    }

    pub fn find_gt(&mut self, key: &[u8]) -> Result<()> {
        self.cursor.find_gt(key)
    }

    pub fn find_le(&mut self, key: &[u8]) -> Result<()> {
        self.cursor.find_le(key)
    }

    pub fn find_lt(&mut self, key: &[u8]) -> Result<()> {
        self.cursor.find_lt(key)
    }

    pub fn find_nearby(&mut self, key: &[u8]) -> Result<()> {
        self.cursor.find_nearby(key)
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.cursor.key()
    }

    pub fn is_positioned(&self) -> bool {
        self.cursor.is_positioned()
    }

    /// Read the whole value at the cursor's position.
    pub fn load(&self) -> Result<Vec<u8>> {
        let key = self.current_key()?;
        acquire_read_lock(&self.txn.txn, self.tree_id, &key)?;
        let (bytes, fragmented) = self.tree_load(&key)?;
        materialize(&self.inner, &bytes, fragmented)
    }

    /// Replace the whole value at the cursor's position.
    pub fn store(&mut self, value: &[u8]) -> Result<()> {
        let key = self.current_key()?;
        acquire_write_lock(&self.txn.txn, self.tree_id, &key)?;
        let old = self.tree_load(&key).ok();
        let (encoded, fragmented) = prepare_value(&self.inner, value)?;
        match &old {
            Some((old_bytes, old_fragmented)) => {
                if *old_fragmented {
                    self.txn.txn.push_undo(UndoRecord::TrashRef { descriptor: old_bytes.clone() })?;
                }
                self.txn.txn.push_undo(UndoRecord::UpdateValue {
                    tree_id: self.tree_id,
                    key: key.clone(),
                    old_value: old_bytes.clone(),
                    old_fragmented: *old_fragmented,
                })?;
            }
            None => self.txn.txn.push_undo(UndoRecord::Insert { tree_id: self.tree_id, key: key.clone() })?,
        }
        self.cursor.store(&encoded, fragmented)?;
        self.log_value(&key, Some((&encoded, fragmented)))
    }

    /// Remove the key at the cursor's position.
    pub fn delete(&mut self) -> Result<()> {
        let key = self.current_key()?;
        acquire_write_lock(&self.txn.txn, self.tree_id, &key)?;
        let (old_bytes, old_fragmented) = self.tree_load(&key)?;
        if old_fragmented {
            self.txn.txn.push_undo(UndoRecord::TrashRef { descriptor: old_bytes.clone() })?;
        }
        self.txn.txn.push_undo(UndoRecord::Delete {
            tree_id: self.tree_id,
            key: key.clone(),
            old_value: old_bytes,
            old_fragmented,
        })?;
        self.cursor.delete()?;
        self.log_value(&key, None)
    }

    /// Commit the owning transaction's current scope.
    pub fn commit(&self) -> Result<()> {
        self.txn.commit()
    }

    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    pub fn close(self) {}

    /// Logical length of the value at the cursor's position.
    pub fn value_length(&self) -> Result<u64> {
        let key = self.current_key()?;
        acquire_read_lock(&self.txn.txn, self.tree_id, &key)?;
        let (bytes, fragmented) = self.tree_load(&key)?;
        if fragmented {
            fragval::value::length(&bytes)
        } else {
            Ok(bytes.len() as u64)
        }
    }

    /// Read up to `buf.len()` bytes starting at `pos`, returning the
    /// number of bytes read.
    pub fn value_read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let key = self.current_key()?;
        acquire_read_lock(&self.txn.txn, self.tree_id, &key)?;
        let (bytes, fragmented) = self.tree_load(&key)?;
        if fragmented {
            fragval::value::read(&self.inner.store, &self.inner.cache, &bytes, pos, buf)
        } else {
            if pos >= bytes.len() as u64 {
                return Ok(0);
            }
            let start = pos as usize;
            let n = buf.len().min(bytes.len() - start);
            buf[..n].copy_from_slice(&bytes[start..start + n]);
            Ok(n)
        }
    }

    /// Write `data` at `pos`, growing the value if the write extends past
    /// its current end, without touching bytes outside `[pos, pos+data.len())`.
    pub fn value_write(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        let key = self.current_key()?;
        acquire_write_lock(&self.txn.txn, self.tree_id, &key)?;
        let (old_bytes, old_fragmented) = self.tree_load(&key).unwrap_or((Vec::new(), false));
        let base = ensure_fragment_base(&self.inner, &old_bytes, old_fragmented)?;
        let new_descriptor = {
            let _commit_guard = self.inner.store.commit_lock_shared();
            fragval::value::write(&self.inner.store, &self.inner.cache, Some(&base), pos, data)?
        };

        if old_fragmented {
            self.txn.txn.push_undo(UndoRecord::TrashRef { descriptor: old_bytes.clone() })?;
        }
        self.txn.txn.push_undo(UndoRecord::UpdateValue {
            tree_id: self.tree_id,
            key: key.clone(),
            old_value: old_bytes,
            old_fragmented,
        })?;
        self.cursor.store(&new_descriptor, true)?;
        self.log_value(&key, Some((&new_descriptor, true)))
    }

    /// Truncate or extend the value at the cursor's position to `new_len`.
    pub fn value_set_length(&mut self, new_len: u64) -> Result<()> {
        let key = self.current_key()?;
        acquire_write_lock(&self.txn.txn, self.tree_id, &key)?;
        let (old_bytes, old_fragmented) = self.tree_load(&key).unwrap_or((Vec::new(), false));
        let base = ensure_fragment_base(&self.inner, &old_bytes, old_fragmented)?;
        let new_descriptor = {
            let _commit_guard = self.inner.store.commit_lock_shared();
            fragval::value::set_length(&self.inner.store, &self.inner.cache, &base, new_len)?
        };

        if old_fragmented {
            self.txn.txn.push_undo(UndoRecord::TrashRef { descriptor: old_bytes.clone() })?;
        }
        self.txn.txn.push_undo(UndoRecord::UpdateValue {
            tree_id: self.tree_id,
            key: key.clone(),
            old_value: old_bytes,
            old_fragmented,
        })?;
        self.cursor.store(&new_descriptor, true)?;
        self.log_value(&key, Some((&new_descriptor, true)))
    }

    /// Clear the value at the cursor's position to zero length.
    pub fn value_clear(&mut self) -> Result<()> {
        self.value_set_length(0)
    }
}

/// A transaction: a scope stack over an undo log, plus the locks it has
/// acquired. Every mutation through an [`Index`] or [`Cursor`] requires
/// one.
pub struct Transaction {
    inner: Arc<Inner>,
    txn: txn::Transaction,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.txn.id()
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.txn.durability_mode()
    }

    pub fn lock_timeout(&self) -> LockTimeout {
        self.txn.lock_timeout()
    }

    pub fn set_lock_timeout(&self, timeout: LockTimeout) {
        self.txn.set_lock_timeout(timeout)
    }

    pub fn lock_mode(&self) -> LockMode {
        self.txn.lock_mode()
    }

    pub fn set_lock_mode(&self, mode: LockMode) {
        self.txn.set_lock_mode(mode)
    }

    pub fn lock_shared(&self, index: &Index, key: &[u8]) -> LockResult {
        self.txn.lock_shared(index.id, key)
    }

    pub fn lock_upgradable(&self, index: &Index, key: &[u8]) -> LockResult {
        self.txn.lock_upgradable(index.id, key)
    }

    pub fn lock_exclusive(&self, index: &Index, key: &[u8]) -> LockResult {
        self.txn.lock_exclusive(index.id, key)
    }

    /// Wake this transaction out of a lock wait it's blocked in from
    /// another thread, e.g. to break an `LockTimeout::Infinite` wait that
    /// would otherwise block forever.
    pub fn interrupt(&self) {
        self.txn.interrupt()
    }

    /// Push a new scope; work done after this can be rolled back on its
    /// own with [`Transaction::exit`] without undoing the rest of the
    /// transaction.
    pub fn enter(&self) {
        self.txn.enter()
    }

    /// Commit the top scope. If this is the outermost scope, the
    /// transaction is durably finished: its redo commit record is
    /// appended (and flushed/synced per its durability mode), its
    /// fragment trash is handed to the background drain, and every lock
    /// it holds is released.
    pub fn commit(&self) -> Result<()> {
        let was_outermost = self.txn.scope_depth() == 1;
        self.txn.commit();
        if was_outermost {
            self.inner.redo.append(redo::RedoOp::TxnCommitFinal, Some(self.txn.id()), b"")?;
            match self.txn.durability_mode() {
                DurabilityMode::Sync => self.inner.redo.sync(false)?,
                DurabilityMode::NoSync => self.inner.redo.flush()?,
                DurabilityMode::NoFlush | DurabilityMode::NoRedo => {}
            }
            for descriptor in self.txn.trash_refs() {
                self.inner.frag_trash.push(descriptor);
            }
            self.inner.highest_txn_id.fetch_max(self.txn.id(), Ordering::SeqCst);
            self.txn.release_all();
            self.txn.forget_durable()?;
        }
        Ok(())
    }

    /// Roll back the top scope. If this is the outermost scope, the
    /// whole transaction is aborted and every lock it holds is released.
    pub fn exit(&self) -> Result<()> {
        let was_outermost = self.txn.scope_depth() == 1;
        let sink = DbUndoSink { inner: &self.inner };
        self.txn.exit(&sink)?;
        if was_outermost {
            self.inner.redo.append(redo::RedoOp::TxnRollbackFinal, Some(self.txn.id()), b"")?;
            self.txn.release_all();
            self.txn.forget_durable()?;
        }
        Ok(())
    }

    /// Roll back every scope and release every lock.
    pub fn reset(&self) -> Result<()> {
        let sink = DbUndoSink { inner: &self.inner };
        self.txn.reset(&sink)?;
        self.inner.redo.append(redo::RedoOp::TxnRollbackFinal, Some(self.txn.id()), b"")?;
        self.txn.forget_durable()?;
        Ok(())
    }
}
