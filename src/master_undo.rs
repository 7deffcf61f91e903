//! The durable master undo log: a page-chained, per-transaction list of
//! inverse operations, tracked in a small in-memory head table that
//! checkpoint snapshots and serializes into the commit header's
//! `master_undo_log_head`.
//!
//! Grounded on `store::freelist::FreeList`'s "chain of dedicated pages,
//! never routed through the node cache" technique, generalized from page
//! ids to arbitrary undo-record bytes. Needed because `undo::UndoLog` by
//! itself is in-process memory only: once a checkpoint's dirty-node flush
//! steals an uncommitted transaction's pages onto disk (the no-steal
//! alternative would serialize every mutation behind every checkpoint),
//! recovery needs a durable way to find and undo them. `PageStore::commit`
//! already defers freeing a page until the commit that stops referencing
//! it has durably landed, which is what keeps a checkpoint's freshly
//! superseded index safe to read if the process crashes before the next
//! checkpoint completes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::btree::Tree;
use crate::cache::NodeCache;
use crate::error::{Error, Result};
use crate::lock::TxnId;
use crate::page::PageId;
use crate::registry::Registry;
use crate::replay::tree_for;
use crate::store::PageStore;

/// `continuation_next(8) | prev_record_head(8) | payload_len(4)`.
const CHAIN_HEADER: usize = 20;

/// One inverse operation durable enough to survive a crash: either
/// "delete this key" (undoes an insert) or "restore this old value"
/// (undoes an update or a delete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableUndoOp {
    Delete { tree_id: u64, key: Vec<u8> },
    Store { tree_id: u64, key: Vec<u8>, old_value: Vec<u8>, old_fragmented: bool },
}

fn encode_op(op: &DurableUndoOp) -> Vec<u8> {
    let mut out = Vec::new();
    match op {
        DurableUndoOp::Delete { tree_id, key } => {
            out.write_u8(0).unwrap();
            out.write_u64::<LittleEndian>(*tree_id).unwrap();
            out.write_u32::<LittleEndian>(key.len() as u32).unwrap();
            out.extend_from_slice(key);
        }
        DurableUndoOp::Store { tree_id, key, old_value, old_fragmented } => {
            out.write_u8(1).unwrap();
            out.write_u64::<LittleEndian>(*tree_id).unwrap();
            out.push(if *old_fragmented { 1 } else { 0 });
            out.write_u32::<LittleEndian>(key.len() as u32).unwrap();
            out.extend_from_slice(key);
            out.extend_from_slice(old_value);
        }
    }
    out
}

fn decode_op(mut bytes: &[u8]) -> Result<DurableUndoOp> {
    let marker = bytes.read_u8().map_err(|_| Error::CorruptStore("durable undo record truncated before marker".into()))?;
    let tree_id = bytes
        .read_u64::<LittleEndian>()
        .map_err(|_| Error::CorruptStore("durable undo record truncated before tree id".into()))?;
    match marker {
        0 => {
            let key_len = bytes
                .read_u32::<LittleEndian>()
                .map_err(|_| Error::CorruptStore("durable undo record truncated before key length".into()))?
                as usize;
            if bytes.len() < key_len {
                return Err(Error::CorruptStore("durable undo record truncated before key".into()));
            }
            Ok(DurableUndoOp::Delete { tree_id, key: bytes[..key_len].to_vec() })
        }
        1 => {
            let old_fragmented = bytes
                .read_u8()
                .map_err(|_| Error::CorruptStore("durable undo record truncated before fragmented flag".into()))?
                != 0;
            let key_len = bytes
                .read_u32::<LittleEndian>()
                .map_err(|_| Error::CorruptStore("durable undo record truncated before key length".into()))?
                as usize;
            if bytes.len() < key_len {
                return Err(Error::CorruptStore("durable undo record truncated before key".into()));
            }
            let key = bytes[..key_len].to_vec();
            let old_value = bytes[key_len..].to_vec();
            Ok(DurableUndoOp::Store { tree_id, key, old_value, old_fragmented })
        }
        other => Err(Error::CorruptStore(format!("unknown durable undo op marker {other}"))),
    }
}

/// Prepend one record's bytes, chained onto `prev_record_head` (0 if this
/// is the transaction's first durable record), splitting across as many
/// pages as needed. Returns the new head page id.
fn prepend_record(store: &PageStore, prev_record_head: PageId, payload: &[u8]) -> Result<PageId> {
    let page_size = store.page_size();
    let capacity = page_size.saturating_sub(CHAIN_HEADER).max(1);
    let chunks: Vec<&[u8]> = if payload.is_empty() { vec![&[][..]] } else { payload.chunks(capacity).collect() };

    let mut continuation_next: PageId = 0;
    let mut staged = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate().rev() {
        let id = store.alloc_page()?;
        staged.push((id, *chunk, continuation_next, i == 0));
        continuation_next = id;
    }
    let head_id = staged.last().map(|(id, ..)| *id).unwrap_or(0);
    for (id, chunk, continuation, is_head) in staged {
        let mut buf = vec![0u8; page_size];
        LittleEndian::write_u64(&mut buf[0..8], continuation);
        LittleEndian::write_u64(&mut buf[8..16], if is_head { prev_record_head } else { 0 });
        LittleEndian::write_u32(&mut buf[16..20], chunk.len() as u32);
        buf[20..20 + chunk.len()].copy_from_slice(chunk);
        store.write_page(id, &buf)?;
    }
    Ok(head_id)
}

/// Reassemble one record's full bytes plus the head of the previous
/// record in the chain, and the set of pages it occupies.
fn read_record(store: &PageStore, head: PageId) -> Result<(Vec<u8>, PageId, Vec<PageId>)> {
    let page_size = store.page_size();
    let mut buf = vec![0u8; page_size];
    store.read_page(head, &mut buf)?;
    let mut continuation_next = LittleEndian::read_u64(&buf[0..8]);
    let prev_record_head = LittleEndian::read_u64(&buf[8..16]);
    let len = LittleEndian::read_u32(&buf[16..20]) as usize;
    let mut out = buf[20..20 + len].to_vec();
    let mut pages = vec![head];
    while continuation_next != 0 {
        let id = continuation_next;
        let mut cbuf = vec![0u8; page_size];
        store.read_page(id, &mut cbuf)?;
        continuation_next = LittleEndian::read_u64(&cbuf[0..8]);
        let clen = LittleEndian::read_u32(&cbuf[16..20]) as usize;
        out.extend_from_slice(&cbuf[20..20 + clen]);
        pages.push(id);
    }
    Ok((out, prev_record_head, pages))
}

/// Free every page belonging to every record in the chain headed by `head`.
pub fn free_chain(store: &PageStore, head: PageId) -> Result<()> {
    let mut cur = head;
    while cur != 0 {
        let (_bytes, prev, pages) = read_record(store, cur)?;
        for page in pages {
            store.delete_page(page);
        }
        cur = prev;
    }
    Ok(())
}

/// Every durable op recorded for one transaction's chain, newest first —
/// exactly the order undo must run in.
pub fn read_all_records(store: &PageStore, head: PageId) -> Result<Vec<DurableUndoOp>> {
    let mut out = Vec::new();
    let mut cur = head;
    while cur != 0 {
        let (bytes, prev, _pages) = read_record(store, cur)?;
        out.push(decode_op(&bytes)?);
        cur = prev;
    }
    Ok(out)
}

/// Serialize a snapshot of open transaction heads into a single durable
/// chain, returning its head page id (0 if there's nothing open).
pub fn write_index(store: &PageStore, entries: &[(TxnId, PageId)]) -> Result<PageId> {
    if entries.is_empty() {
        return Ok(0);
    }
    let mut blob = Vec::with_capacity(4 + entries.len() * 16);
    blob.write_u32::<LittleEndian>(entries.len() as u32).unwrap();
    for (txn, head) in entries {
        blob.write_u64::<LittleEndian>(*txn).unwrap();
        blob.write_u64::<LittleEndian>(*head).unwrap();
    }
    prepend_record(store, 0, &blob)
}

/// Read back an index written by [`write_index`].
pub fn read_index(store: &PageStore, head: PageId) -> Result<Vec<(TxnId, PageId)>> {
    if head == 0 {
        return Ok(Vec::new());
    }
    let (bytes, _prev, _pages) = read_record(store, head)?;
    let mut b = &bytes[..];
    let count = b
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::CorruptStore("master undo index truncated before count".into()))? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let txn = b
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::CorruptStore("master undo index truncated before txn id".into()))?;
        let head = b
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::CorruptStore("master undo index truncated before head".into()))?;
        out.push((txn, head));
    }
    Ok(out)
}

/// Undo every transaction in `index` that didn't reach a final commit or
/// rollback marker in the redo stream just replayed, applying records
/// newest-first, then free that transaction's chain. Run once at startup,
/// after redo replay and before the post-recovery checkpoint.
#[allow(clippy::too_many_arguments)]
pub fn recover(
    store: &Arc<PageStore>,
    cache: &Arc<NodeCache>,
    registry: &Registry,
    open_trees: &RwLock<HashMap<u64, Arc<Tree>>>,
    index_head: PageId,
    terminal_txns: &HashSet<u64>,
) -> Result<()> {
    if index_head == 0 {
        return Ok(());
    }
    for (txn_id, head) in read_index(store, index_head)? {
        if terminal_txns.contains(&txn_id) {
            continue;
        }
        for op in read_all_records(store, head)? {
            match op {
                DurableUndoOp::Delete { tree_id, key } => {
                    tree_for(store, cache, registry, open_trees, tree_id)?.delete(&key)?;
                }
                DurableUndoOp::Store { tree_id, key, old_value, old_fragmented } => {
                    tree_for(store, cache, registry, open_trees, tree_id)?.insert(&key, &old_value, old_fragmented)?;
                }
            }
        }
        free_chain(store, head)?;
    }
    Ok(())
}

/// In-memory registry of every currently-open transaction's durable undo
/// chain head. A checkpoint snapshots this while holding the commit lock
/// exclusive, so the snapshot always reflects exactly the set of
/// transactions whose dirty pages this checkpoint might steal.
pub struct MasterUndoLog {
    heads: Mutex<HashMap<TxnId, PageId>>,
}

impl MasterUndoLog {
    pub fn new() -> Self {
        MasterUndoLog { heads: Mutex::new(HashMap::new()) }
    }

    /// Durably record one more inverse operation for `txn`, prepending it
    /// to that transaction's chain. Must be called before the
    /// corresponding tree mutation acquires the commit lock shared, so a
    /// concurrent checkpoint can never observe the dirtied node without
    /// also observing this record.
    pub fn push(&self, store: &PageStore, txn: TxnId, op: &DurableUndoOp) -> Result<()> {
        let bytes = encode_op(op);
        let mut heads = self.heads.lock().unwrap();
        let prev = heads.get(&txn).copied().unwrap_or(0);
        let new_head = prepend_record(store, prev, &bytes)?;
        heads.insert(txn, new_head);
        Ok(())
    }

    /// Drop `txn`'s chain and free its pages. Called once the transaction
    /// is durably committed or has fully rolled back, so it no longer
    /// needs undoing.
    pub fn forget(&self, store: &PageStore, txn: TxnId) -> Result<()> {
        let head = self.heads.lock().unwrap().remove(&txn);
        if let Some(head) = head {
            free_chain(store, head)?;
        }
        Ok(())
    }

    /// A snapshot of every currently-open transaction's chain head.
    pub fn snapshot(&self) -> Vec<(TxnId, PageId)> {
        self.heads.lock().unwrap().iter().map(|(&t, &h)| (t, h)).collect()
    }
}

impl Default for MasterUndoLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn push_then_read_all_is_newest_first() {
        let config = Config::in_memory();
        let store = PageStore::open(&config).unwrap();
        let log = MasterUndoLog::new();

        log.push(&store, 1, &DurableUndoOp::Delete { tree_id: 0, key: b"a".to_vec() }).unwrap();
        log.push(
            &store,
            1,
            &DurableUndoOp::Store { tree_id: 0, key: b"b".to_vec(), old_value: b"old".to_vec(), old_fragmented: false },
        )
        .unwrap();

        let head = log.snapshot().into_iter().find(|(t, _)| *t == 1).unwrap().1;
        let records = read_all_records(&store, head).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            DurableUndoOp::Store { tree_id: 0, key: b"b".to_vec(), old_value: b"old".to_vec(), old_fragmented: false }
        );
        assert_eq!(records[1], DurableUndoOp::Delete { tree_id: 0, key: b"a".to_vec() });
    }

    #[test]
    fn forget_frees_chain_and_clears_snapshot() {
        let config = Config::in_memory();
        let store = PageStore::open(&config).unwrap();
        let log = MasterUndoLog::new();
        log.push(&store, 7, &DurableUndoOp::Delete { tree_id: 0, key: b"k".to_vec() }).unwrap();
        assert_eq!(log.snapshot().len(), 1);
        log.forget(&store, 7).unwrap();
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn index_round_trips() {
        let config = Config::in_memory();
        let store = PageStore::open(&config).unwrap();
        let entries = vec![(1u64, 10u64), (2, 20)];
        let head = write_index(&store, &entries).unwrap();
        assert_eq!(read_index(&store, head).unwrap(), entries);
        assert_eq!(write_index(&store, &[]).unwrap(), 0);
        assert!(read_index(&store, 0).unwrap().is_empty());
    }
}
