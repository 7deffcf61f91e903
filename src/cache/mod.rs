//! L2 — the bounded node cache: resident B+tree nodes, their dirty state,
//! the MRU/LRU list with a flush barrier, and the fragment cache.

pub mod frag;
pub mod latch;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::page::{PageBuf, PageId};
use crate::store::PageStore;

use latch::Latch;

/// Node kind, per the specification's data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Internal,
    Leaf,
    Fragment,
    UndoLog,
    Stub,
}

/// `{Clean, DirtyA, DirtyB, FlushedA, FlushedB}`, encoded so that
/// `dirty_X - 2 == flushed_X` and back, per the specification's Design
/// Notes. `Clean` is 0; `DirtyA`/`DirtyB` are 3/4; `FlushedA`/`FlushedB`
/// are 1/2 (`dirty - 2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedState {
    Clean,
    FlushedA,
    FlushedB,
    DirtyA,
    DirtyB,
}

impl CachedState {
    fn code(self) -> u8 {
        match self {
            CachedState::Clean => 0,
            CachedState::FlushedA => 1,
            CachedState::FlushedB => 2,
            CachedState::DirtyA => 3,
            CachedState::DirtyB => 4,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => CachedState::Clean,
            1 => CachedState::FlushedA,
            2 => CachedState::FlushedB,
            3 => CachedState::DirtyA,
            4 => CachedState::DirtyB,
            _ => unreachable!("invalid cached state code"),
        }
    }

    /// `dirty_X -> flushed_X`: flushing keeps the page resident (so a
    /// re-dirty doesn't need a fresh page id) but marks it safe to evict.
    pub fn flushed(self) -> Self {
        match self {
            CachedState::DirtyA | CachedState::DirtyB => Self::from_code(self.code() - 2),
            other => other,
        }
    }

    /// `flushed_X -> dirty_X`.
    pub fn redirtied(self) -> Self {
        match self {
            CachedState::FlushedA | CachedState::FlushedB => Self::from_code(self.code() + 2),
            other => other,
        }
    }

    pub fn is_dirty(self) -> bool {
        matches!(self, CachedState::DirtyA | CachedState::DirtyB)
    }

    pub fn is_flushed_dirty(self) -> bool {
        matches!(self, CachedState::FlushedA | CachedState::FlushedB)
    }

    pub fn belongs_to(self, commit_state: bool) -> bool {
        let want = if commit_state {
            CachedState::DirtyA
        } else {
            CachedState::DirtyB
        };
        self == want || self.flushed() == want.flushed()
    }

    pub fn dirty_for(commit_state: bool) -> Self {
        if commit_state {
            CachedState::DirtyA
        } else {
            CachedState::DirtyB
        }
    }
}

/// The in-memory incarnation of a page.
pub struct Node {
    pub id: Mutex<PageId>,
    pub kind: Mutex<NodeKind>,
    pub buf: Mutex<PageBuf>,
    pub state: Mutex<CachedState>,
    pub latch: Latch,
    /// Bumped to odd while a split touching this node is in flight, even
    /// once finished. Checkpoint waits for this to go even before flushing.
    pub split_epoch: std::sync::atomic::AtomicU64,
    pub pinned: std::sync::atomic::AtomicBool,
    /// Set once this node's page id has appeared in a durable commit.
    /// Distinguishes "redirect the old id to deferred delete" from "the old
    /// id was never visible outside this transaction, recycle it at once".
    pub ever_committed: std::sync::atomic::AtomicBool,
    lru_prev: Mutex<Option<Arc<Node>>>,
    lru_next: Mutex<Option<Arc<Node>>>,
}

impl Node {
    fn new(page_size: usize) -> Arc<Node> {
        Arc::new(Node {
            id: Mutex::new(0),
            kind: Mutex::new(NodeKind::Stub),
            buf: Mutex::new(PageBuf::zeroed(page_size)),
            state: Mutex::new(CachedState::Clean),
            latch: Latch::new(),
            split_epoch: std::sync::atomic::AtomicU64::new(0),
            pinned: std::sync::atomic::AtomicBool::new(false),
            ever_committed: std::sync::atomic::AtomicBool::new(false),
            lru_prev: Mutex::new(None),
            lru_next: Mutex::new(None),
        })
    }

    pub fn page_id(&self) -> PageId {
        *self.id.lock().unwrap()
    }

    pub fn is_splitting(&self) -> bool {
        self.split_epoch.load(std::sync::atomic::Ordering::SeqCst) % 2 == 1
    }
}

struct Lru {
    /// Most-recently-used end.
    head: Option<Arc<Node>>,
    /// Least-recently-used end.
    tail: Option<Arc<Node>>,
    order: Vec<Arc<Node>>,
    /// Index (from the MRU end) of the flush barrier.
    barrier: usize,
}

impl Lru {
    fn new() -> Self {
        Lru {
            head: None,
            tail: None,
            order: Vec::new(),
            barrier: 0,
        }
    }

    fn touch_most_recently_used(&mut self, node: &Arc<Node>) {
        self.order.retain(|n| !Arc::ptr_eq(n, node));
        self.order.insert(0, node.clone());
        self.head = self.order.first().cloned();
        self.tail = self.order.last().cloned();
    }

    fn remove(&mut self, node: &Arc<Node>) {
        self.order.retain(|n| !Arc::ptr_eq(n, node));
        self.head = self.order.first().cloned();
        self.tail = self.order.last().cloned();
        if self.barrier > self.order.len() {
            self.barrier = self.order.len();
        }
    }

    /// Recompute the barrier's target distance from MRU, in nodes, given a
    /// byte threshold and the page size.
    fn retarget(&mut self, flush_threshold_bytes: i64, page_size: usize) {
        if flush_threshold_bytes < 0 {
            self.barrier = self.order.len();
            return;
        }
        let target = (flush_threshold_bytes as usize / page_size.max(1)).min(self.order.len());
        self.barrier = target;
    }

    fn flush_zone(&self) -> &[Arc<Node>] {
        &self.order[self.barrier.min(self.order.len())..]
    }
}

/// Bounded pool of cached nodes.
pub struct NodeCache {
    page_size: usize,
    min_nodes: usize,
    max_nodes: usize,
    flush_threshold_bytes: i64,
    resident: Mutex<HashMap<PageId, Arc<Node>>>,
    lru: Mutex<Lru>,
    pub frag_cache: frag::FragCache,
    /// `false`/`true` selects DirtyA/DirtyB as "current"; flips each checkpoint.
    commit_state: std::sync::atomic::AtomicBool,
}

impl NodeCache {
    pub fn new(page_size: usize, min_bytes: usize, max_bytes: usize, flush_threshold_bytes: i64, frag_shards: usize) -> Self {
        let min_nodes = (min_bytes / page_size.max(1)).max(3);
        let max_nodes = (max_bytes / page_size.max(1)).max(min_nodes);
        NodeCache {
            page_size,
            min_nodes,
            max_nodes,
            flush_threshold_bytes,
            resident: Mutex::new(HashMap::new()),
            lru: Mutex::new(Lru::new()),
            frag_cache: frag::FragCache::new(frag_shards),
            commit_state: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn current_commit_state(&self) -> bool {
        self.commit_state.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn flip_commit_state(&self) {
        self.commit_state.fetch_xor(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Allocate a fresh, exclusively latched, clean node with id 0, evicting
    /// if the pool is already at its maximum.
    pub fn alloc_latched(&self) -> Result<Arc<Node>> {
        let mut resident = self.resident.lock().unwrap();
        let mut lru = self.lru.lock().unwrap();
        if resident.len() >= self.max_nodes {
            drop(resident);
            drop(lru);
            self.evict_one()?;
            resident = self.resident.lock().unwrap();
            lru = self.lru.lock().unwrap();
        }
        let node = Node::new(self.page_size);
        lru.touch_most_recently_used(&node);
        lru.retarget(self.flush_threshold_bytes, self.page_size);
        let _ = &mut *resident; // placeholder id=0 nodes are not indexed until assigned a real id
        Ok(node)
    }

    /// Load a node (shared-latched), fetching its bytes via the store if
    /// not already resident.
    pub fn load(&self, store: &PageStore, id: PageId) -> Result<Arc<Node>> {
        if let Some(node) = self.resident.lock().unwrap().get(&id).cloned() {
            self.mark_used(&node);
            return Ok(node);
        }
        let node = self.reserve_slot(id)?;
        {
            let mut buf = node.buf.lock().unwrap();
            store.read_page(id, &mut buf)?;
        }
        *node.id.lock().unwrap() = id;
        self.resident.lock().unwrap().insert(id, node.clone());
        Ok(node)
    }

    /// Register a page id the caller just obtained from `store.alloc_page`
    /// as a brand-new resident node, dirty for the current checkpoint from
    /// the start (no prior committed body to preserve, unlike `make_dirty`).
    pub fn new_dirty_node(&self, id: PageId) -> Result<Arc<Node>> {
        let node = self.reserve_slot(id)?;
        *node.id.lock().unwrap() = id;
        *node.state.lock().unwrap() = CachedState::dirty_for(self.current_commit_state());
        self.resident.lock().unwrap().insert(id, node.clone());
        Ok(node)
    }

    fn reserve_slot(&self, _for_id: PageId) -> Result<Arc<Node>> {
        let mut resident = self.resident.lock().unwrap();
        if resident.len() >= self.max_nodes {
            drop(resident);
            self.evict_one()?;
            resident = self.resident.lock().unwrap();
        }
        let node = Node::new(self.page_size);
        let mut lru = self.lru.lock().unwrap();
        lru.touch_most_recently_used(&node);
        lru.retarget(self.flush_threshold_bytes, self.page_size);
        let _ = &mut *resident;
        Ok(node)
    }

    pub fn mark_used(&self, node: &Arc<Node>) {
        if let Ok(mut lru) = self.lru.try_lock() {
            lru.touch_most_recently_used(node);
            lru.retarget(self.flush_threshold_bytes, self.page_size);
        }
    }

    /// Make `node` dirty with respect to the current checkpoint. If it was
    /// already dirty for the current checkpoint, this is a no-op; if it was
    /// flushed-dirty (resident but safe to evict) it is simply re-marked
    /// dirty without reallocating a page id. Otherwise a fresh page id is
    /// obtained from `store` and the old id is scheduled for deferred
    /// delete (or immediate recycle, if it was never durable).
    pub fn make_dirty(&self, store: &PageStore, node: &Arc<Node>) -> Result<bool> {
        let mut state = node.state.lock().unwrap();
        let want = CachedState::dirty_for(self.current_commit_state());
        if *state == want {
            return Ok(false);
        }
        if state.is_flushed_dirty() && state.flushed() == want.flushed() {
            *state = state.redirtied();
            return Ok(false);
        }
        let old_id = *node.id.lock().unwrap();
        let new_id = store.alloc_page()?;
        if old_id != 0 {
            if node.ever_committed.load(std::sync::atomic::Ordering::SeqCst) {
                store.delete_page(old_id);
            } else {
                store.recycle_page(old_id);
            }
        }
        *node.id.lock().unwrap() = new_id;
        node.ever_committed.store(false, std::sync::atomic::Ordering::SeqCst);
        *state = want;
        trace!("make_dirty: {old_id} -> {new_id}");
        Ok(true)
    }

    pub fn delete_node(&self, store: &PageStore, node: &Arc<Node>) {
        let id = *node.id.lock().unwrap();
        if id == 0 {
            return;
        }
        if node.ever_committed.load(std::sync::atomic::Ordering::SeqCst) {
            store.delete_page(id);
        } else {
            store.recycle_page(id);
        }
        self.resident.lock().unwrap().remove(&id);
        self.lru.lock().unwrap().remove(node);
    }

    /// All dirty nodes whose state belongs to the *old* commit state
    /// (i.e. dirtied before the in-progress checkpoint began), sorted by
    /// page id to promote sequential writes, per the checkpoint algorithm.
    pub fn collect_old_dirty(&self, old_commit_state: bool) -> Vec<Arc<Node>> {
        let resident = self.resident.lock().unwrap();
        let mut out: Vec<Arc<Node>> = resident
            .values()
            .filter(|n| {
                let st = *n.state.lock().unwrap();
                st.is_dirty() && st == CachedState::dirty_for(old_commit_state)
            })
            .cloned()
            .collect();
        out.sort_by_key(|n| n.page_id());
        out
    }

    pub fn mark_clean(&self, node: &Arc<Node>) {
        *node.state.lock().unwrap() = CachedState::Clean;
    }

    fn evict_one(&self) -> Result<()> {
        const MAX_ATTEMPTS: usize = 64;
        let mut resident = self.resident.lock().unwrap();
        let mut lru = self.lru.lock().unwrap();
        let candidates: Vec<Arc<Node>> = lru.order.iter().rev().take(MAX_ATTEMPTS).cloned().collect();
        for node in candidates {
            if node.pinned.load(std::sync::atomic::Ordering::SeqCst) || node.is_splitting() {
                continue;
            }
            if let Some(_guard) = node.latch.try_lock_exclusive() {
                let state = *node.state.lock().unwrap();
                if state.is_dirty() {
                    continue;
                }
                let id = node.page_id();
                resident.remove(&id);
                lru.remove(&node);
                return Ok(());
            }
        }
        Err(Error::CacheExhausted { attempts: MAX_ATTEMPTS })
    }

    /// Nodes currently in the flush zone that are dirty-for-the-previous
    /// checkpoint: candidates for async background flushing to reduce
    /// checkpoint latency.
    pub fn flush_zone_dirty(&self) -> Vec<Arc<Node>> {
        let lru = self.lru.lock().unwrap();
        lru.flush_zone()
            .iter()
            .filter(|n| n.state.lock().unwrap().is_dirty())
            .cloned()
            .collect()
    }

    /// Write bytes for every node [`flush_zone_dirty`] currently reports,
    /// so an upcoming checkpoint has fewer pages left to flush under its
    /// exclusive commit lock. Nodes are marked `flushed()`, not `Clean` —
    /// checkpoint still needs to see them as dirty-for-their-generation to
    /// update `ever_committed` and fold them into the commit set; this only
    /// lets them be evicted under memory pressure ahead of that. Returns
    /// the number of nodes written.
    pub fn flush_zone_pass(&self, store: &PageStore) -> Result<usize> {
        let mut flushed = 0;
        for node in self.flush_zone_dirty() {
            let _shared = node.latch.lock_shared();
            let mut state = node.state.lock().unwrap();
            if !state.is_dirty() {
                continue;
            }
            let buf = node.buf.lock().unwrap();
            store.write_page(node.page_id(), &buf)?;
            drop(buf);
            *state = state.flushed();
            flushed += 1;
        }
        Ok(flushed)
    }

    pub fn resident_count(&self) -> usize {
        self.resident.lock().unwrap().len()
    }

    pub fn min_nodes(&self) -> usize {
        self.min_nodes
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }
}

/// Spawn a background thread that periodically runs [`NodeCache::flush_zone_pass`],
/// mirroring `checkpoint::spawn_background_trigger`'s poll-on-a-timer shape.
pub fn spawn_flush_zone_worker(
    cache: Arc<NodeCache>,
    store: Arc<PageStore>,
    interval: Duration,
    stop: Arc<std::sync::atomic::AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(interval);
            if stop.load(Ordering::SeqCst) {
                break;
            }
            match cache.flush_zone_pass(&store) {
                Ok(n) if n > 0 => trace!("flush zone pass wrote {n} dirty nodes"),
                Ok(_) => {}
                Err(e) => warn!("flush zone pass failed: {e}"),
            }
        }
    })
}
