//! Fragmented-value trash: chains of fragment/inode pages orphaned by an
//! overwritten or deleted leaf entry, held until no in-flight transaction
//! could still need them for rollback, then freed.
//!
//! Grounded on the same deferred-reclaim shape as an index's own trash
//! lifecycle (`registry::Registry::mark_trash`/`finish_trash`): both defer
//! destructive page work past the moment a transaction decides to drop
//! something, since an abort can still need the old bytes.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::cache::NodeCache;
use crate::error::Result;
use crate::store::PageStore;

use super::value;

/// One descriptor's worth of pages, queued for reclaim once the
/// transaction that orphaned it has durably committed (so no rollback can
/// reach back for them).
struct Entry {
    descriptor: Vec<u8>,
}

pub struct TrashQueue {
    entries: Mutex<VecDeque<Entry>>,
}

impl TrashQueue {
    pub fn new() -> Self {
        TrashQueue { entries: Mutex::new(VecDeque::new()) }
    }

    /// Record a fragmented value's top-level descriptor as no longer
    /// reachable from any live leaf entry.
    pub fn push(&self, descriptor: Vec<u8>) {
        self.entries.lock().unwrap().push_back(Entry { descriptor });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free every page reachable from one queued descriptor. Returns
    /// `false` once the queue is empty.
    pub fn drain_one(&self, store: &PageStore, cache: &NodeCache) -> Result<bool> {
        let entry = self.entries.lock().unwrap().pop_front();
        let Some(entry) = entry else { return Ok(false) };
        let _commit_guard = store.commit_lock_shared();
        for page in value::trash_all(store, cache, &entry.descriptor)? {
            store.delete_page(page);
            cache.frag_cache.remove(page);
        }
        Ok(true)
    }

    /// Drain every currently-queued descriptor.
    pub fn drain_all(&self, store: &PageStore, cache: &NodeCache) -> Result<usize> {
        let mut freed = 0;
        while self.drain_one(store, cache)? {
            freed += 1;
        }
        Ok(freed)
    }
}

impl Default for TrashQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fragval::descriptor::{self, Layout};

    #[test]
    fn drain_frees_queued_direct_pages() {
        let config = Config::in_memory();
        let store = PageStore::open(&config).unwrap();
        let cache = NodeCache::new(config.page_size, 1 << 16, 1 << 20, 1 << 16, 4);

        let page_id = store.alloc_page().unwrap();
        let desc = descriptor::Descriptor {
            total_len: config.page_size as u64,
            inline: Vec::new(),
            layout: Layout::Direct(vec![page_id]),
        };

        let queue = TrashQueue::new();
        queue.push(descriptor::encode(&desc));
        assert_eq!(queue.len(), 1);

        let freed = queue.drain_all(&store, &cache).unwrap();
        assert_eq!(freed, 1);
        assert!(queue.is_empty());
    }
}
