//! The fragment cache: a sharded, lossy hash table of resident
//! fragment-type nodes (large-value fragment and inode pages), keyed by
//! page id. One latch per shard; a collision simply evicts the prior
//! occupant rather than chaining, per the specification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use xxhash_rust::xxh3::xxh3_64;

use crate::cache::Node;
use crate::page::PageId;

struct Shard {
    map: HashMap<PageId, Arc<Node>>,
}

pub struct FragCache {
    shards: Vec<Mutex<Shard>>,
    mask: u64,
}

impl FragCache {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    map: HashMap::new(),
                })
            })
            .collect();
        FragCache {
            shards,
            mask: shard_count as u64 - 1,
        }
    }

    fn shard_for(&self, id: PageId) -> &Mutex<Shard> {
        let h = xxh3_64(&id.to_le_bytes());
        &self.shards[(h & self.mask) as usize]
    }

    pub fn get(&self, id: PageId) -> Option<Arc<Node>> {
        self.shard_for(id).lock().unwrap().map.get(&id).cloned()
    }

    /// Insert a fragment node, evicting whatever previously occupied that
    /// slot on a hash collision.
    pub fn insert(&self, id: PageId, node: Arc<Node>) {
        self.shard_for(id).lock().unwrap().map.insert(id, node);
    }

    pub fn remove(&self, id: PageId) {
        self.shard_for(id).lock().unwrap().map.remove(&id);
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeKind;

    fn dummy_node() -> Arc<Node> {
        let cache = crate::cache::NodeCache::new(512, 4096, 4096, 1 << 20, 4);
        let node = cache.alloc_latched().unwrap();
        *node.kind.lock().unwrap() = NodeKind::Fragment;
        node
    }

    #[test]
    fn insert_and_get() {
        let cache = FragCache::new(4);
        let node = dummy_node();
        cache.insert(42, node.clone());
        assert!(Arc::ptr_eq(&cache.get(42).unwrap(), &node));
        assert!(cache.get(43).is_none());
    }

    #[test]
    fn shard_count_rounds_to_power_of_two() {
        let cache = FragCache::new(5);
        assert_eq!(cache.shard_count(), 8);
    }
}
