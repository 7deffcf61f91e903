//! Persistent free-page-id queue.
//!
//! Kept as a plain in-memory `Vec` that is serialized into a small chain of
//! dedicated pages on each commit. Those chain pages are never returned to
//! the list they describe and are grown by extending the file directly
//! (never through `FreeList` itself) — the "reserved head-room" the
//! specification calls for, so persisting the free list on a commit can
//! never need the free list to hand out a page first.

use byteorder::{ByteOrder, LittleEndian};

use crate::page::PageId;

const CHAIN_HEADER: usize = 16; // next page id (8) + id count in this page (8)

#[derive(Debug, Default)]
pub struct FreeList {
    /// Ids safe to hand out immediately.
    free: Vec<PageId>,
    /// Ids deleted since the in-flight commit began; folded into `free`
    /// only once that commit durably succeeds.
    pending: Vec<PageId>,
    /// Ids reserved purely for serializing this structure's own chain.
    pub(crate) chain_pages: Vec<PageId>,
}

impl FreeList {
    pub fn new() -> Self {
        FreeList::default()
    }

    pub fn alloc(&mut self) -> Option<PageId> {
        self.free.pop()
    }

    /// A page that was never part of a committed image may be reused at once.
    pub fn recycle(&mut self, id: PageId) {
        self.free.push(id);
    }

    /// A page that is part of the durable image must wait until the next
    /// commit succeeds before it can be reused.
    pub fn defer_delete(&mut self, id: PageId) {
        self.pending.push(id);
    }

    /// Called once a commit has durably succeeded: pages deferred during
    /// that commit's preparation are now safe to reuse.
    pub fn rotate_after_commit(&mut self) {
        self.free.append(&mut self.pending);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// How many pages are needed to serialize the current free list, given
    /// the usable payload per page.
    pub fn pages_needed(&self, page_size: usize) -> usize {
        let ids_per_page = (page_size - CHAIN_HEADER) / 8;
        if self.free.is_empty() {
            0
        } else {
            self.free.len().div_ceil(ids_per_page)
        }
    }

    /// Serialize into the provided chain pages (already sized to fit by the
    /// caller via [`FreeList::pages_needed`]).
    pub fn encode(&self, page_size: usize, pages: &[PageId]) -> Vec<(PageId, Vec<u8>)> {
        let ids_per_page = (page_size - CHAIN_HEADER) / 8;
        let mut out = Vec::with_capacity(pages.len());
        for (i, chunk) in self.free.chunks(ids_per_page.max(1)).enumerate() {
            let mut buf = vec![0u8; page_size];
            let next = pages.get(i + 1).copied().unwrap_or(0);
            LittleEndian::write_u64(&mut buf[0..8], next);
            LittleEndian::write_u64(&mut buf[8..16], chunk.len() as u64);
            for (j, id) in chunk.iter().enumerate() {
                let off = CHAIN_HEADER + j * 8;
                LittleEndian::write_u64(&mut buf[off..off + 8], *id);
            }
            out.push((pages[i], buf));
        }
        out
    }

    /// Rebuild the in-memory free list from its on-disk chain, given a page
    /// reader callback.
    pub fn decode(
        head: PageId,
        page_size: usize,
        mut read_page: impl FnMut(PageId) -> Vec<u8>,
    ) -> Self {
        let mut free = Vec::new();
        let mut chain_pages = Vec::new();
        let mut next = head;
        while next != 0 {
            chain_pages.push(next);
            let buf = read_page(next);
            let chain_next = LittleEndian::read_u64(&buf[0..8]);
            let count = LittleEndian::read_u64(&buf[8..16]) as usize;
            for j in 0..count {
                let off = CHAIN_HEADER + j * 8;
                free.push(LittleEndian::read_u64(&buf[off..off + 8]));
            }
            let _ = page_size;
            next = chain_next;
        }
        FreeList {
            free,
            pending: Vec::new(),
            chain_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn alloc_recycle_and_deferred_delete() {
        let mut fl = FreeList::new();
        assert_eq!(fl.alloc(), None);
        fl.recycle(10);
        fl.recycle(11);
        assert_eq!(fl.len(), 2);
        fl.defer_delete(20);
        // 20 must not be reusable before the commit that deferred it succeeds.
        assert!(fl.alloc() == Some(11) || fl.alloc() == Some(10));
        fl.rotate_after_commit();
        assert!(fl.len() >= 1);
    }

    #[test]
    fn encode_decode_chain_round_trip() {
        let mut fl = FreeList::new();
        for id in 100..260 {
            fl.recycle(id);
        }
        let page_size = 512;
        let needed = fl.pages_needed(page_size);
        assert!(needed > 1);
        let chain_ids: Vec<PageId> = (1000..1000 + needed as u64).collect();
        let pages = fl.encode(page_size, &chain_ids);
        let mut store: HashMap<PageId, Vec<u8>> = pages.into_iter().collect();
        let head = chain_ids[0];
        let restored = FreeList::decode(head, page_size, |id| store.remove(&id).unwrap());
        let mut restored_ids = restored.free.clone();
        restored_ids.sort();
        let mut expected: Vec<PageId> = (100..260).collect();
        expected.sort();
        assert_eq!(restored_ids, expected);
    }
}
