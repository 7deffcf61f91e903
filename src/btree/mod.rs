//! L3 — the copy-on-write B+tree: node layout, latch-coupled cursors, and
//! the mutation path (insert/delete/split/merge) that dirties pages through
//! the node cache rather than ever writing in place.
//!
//! Grounded on `crab-dads`' `btree::reader`/`btree::writer` (the COW
//! try-load-then-copy pattern) and `crab-db`'s block framing, but the node
//! layout itself is reimplemented (see [`layout`]) over safe slices.

pub mod cursor;
pub mod layout;
pub mod writer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{Node, NodeCache, NodeKind};
use crate::error::Result;
use crate::page::PageId;
use crate::store::PageStore;

pub use cursor::Cursor;

/// A single copy-on-write B+tree, identified by the page id of its current
/// root. Multiple `Tree` handles may share one `NodeCache`/`PageStore`.
///
/// Structural mutations (insert/delete) are serialized by `write_lock`: a
/// simplification over full lock-coupled concurrent writers, chosen so
/// splits can be done preemptively on the way down without a parent-frame
/// stack. Readers never take this lock — they only ever hold one node's
/// shared latch at a time.
pub struct Tree {
    root: AtomicU64,
    cache: Arc<NodeCache>,
    store: Arc<PageStore>,
    write_lock: Mutex<()>,
}

impl Tree {
    /// Allocate a brand-new, empty tree (a single empty leaf root).
    pub fn create(store: Arc<PageStore>, cache: Arc<NodeCache>) -> Result<Self> {
        let root = store.alloc_page()?;
        let node = cache.new_dirty_node(root)?;
        {
            let excl = node.latch.lock_exclusive();
            let _ = &excl;
            let mut buf = node.buf.lock().unwrap();
            layout::init_leaf(&mut buf);
            *node.kind.lock().unwrap() = NodeKind::Leaf;
        }
        Ok(Tree {
            root: AtomicU64::new(root),
            cache,
            store,
            write_lock: Mutex::new(()),
        })
    }

    /// Attach to an existing tree given its persisted root page id.
    pub fn open(store: Arc<PageStore>, cache: Arc<NodeCache>, root: PageId) -> Self {
        Tree {
            root: AtomicU64::new(root),
            cache,
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> PageId {
        self.root.load(Ordering::Acquire)
    }

    fn set_root(&self, id: PageId) {
        self.root.store(id, Ordering::Release);
    }

    pub(crate) fn lock_writer(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap()
    }

    pub(crate) fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    pub(crate) fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    fn load_root(&self) -> Result<Arc<Node>> {
        self.cache.load(&self.store, self.root())
    }

    /// Point lookup. Returns the raw stored value bytes (which may be a
    /// fragment descriptor rather than the literal value; callers that care
    /// about fragmentation use [`Cursor`] instead).
    pub fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, bool)>> {
        let mut node = self.load_root()?;
        loop {
            let guard = node.latch.lock_shared();
            let buf = node.buf.lock().unwrap();
            if layout::is_leaf(&buf) {
                return Ok(match layout::search(&buf, key, true) {
                    Ok(i) => Some((layout::leaf_value_at(&buf, i).to_vec(), layout::leaf_fragmented_at(&buf, i))),
                    Err(_) => None,
                });
            }
            let child_id = layout::internal_child_for_key(&buf, key);
            drop(buf);
            drop(guard);
            node = self.cache.load(&self.store, child_id)?;
        }
    }

    /// Structural mutation: holds the store's commit lock shared for the
    /// duration of the dirty/mutate step so a concurrent checkpoint's
    /// exclusive acquisition (flipping the commit-state bit) genuinely
    /// fences mutators out rather than racing them.
    pub fn insert(&self, key: &[u8], value: &[u8], fragmented: bool) -> Result<()> {
        let _commit_guard = self.store.commit_lock_shared();
        writer::insert(self, key, value, fragmented)
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let _commit_guard = self.store.commit_lock_shared();
        writer::delete(self, key)
    }

    pub(crate) fn descend_leftmost(&self) -> Result<Arc<Node>> {
        let mut node = self.load_root()?;
        loop {
            let buf = node.buf.lock().unwrap();
            if layout::is_leaf(&buf) {
                drop(buf);
                return Ok(node);
            }
            let child_id = layout::internal_child_at(&buf, 0);
            drop(buf);
            node = self.cache.load(&self.store, child_id)?;
        }
    }

    pub(crate) fn descend_rightmost(&self) -> Result<Arc<Node>> {
        let mut node = self.load_root()?;
        loop {
            let buf = node.buf.lock().unwrap();
            if layout::is_leaf(&buf) {
                drop(buf);
                return Ok(node);
            }
            let n = layout::key_count(&buf);
            let child_id = layout::internal_child_at(&buf, n);
            drop(buf);
            node = self.cache.load(&self.store, child_id)?;
        }
    }

    pub(crate) fn descend_to_leaf(&self, key: &[u8]) -> Result<Arc<Node>> {
        let mut node = self.load_root()?;
        loop {
            let buf = node.buf.lock().unwrap();
            if layout::is_leaf(&buf) {
                drop(buf);
                return Ok(node);
            }
            let child_id = layout::internal_child_for_key(&buf, key);
            drop(buf);
            node = self.cache.load(&self.store, child_id)?;
        }
    }

    pub fn is_empty_tree(&self) -> Result<bool> {
        let node = self.load_root()?;
        let _g = node.latch.lock_shared();
        let buf = node.buf.lock().unwrap();
        Ok(layout::is_leaf(&buf) && layout::leaf_is_empty(&buf))
    }
}
