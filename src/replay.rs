//! Encoding for the payloads carried by value-mutation redo records
//! (`RedoOp::TxnStore` and friends), and the startup replay pass that
//! re-applies writes recorded since the last checkpoint for transactions
//! that reached a final commit.
//!
//! Grounded on `spec.md` §4.5's replay description: records are grouped by
//! transaction id so one transaction's writes apply in order, while
//! distinct transactions' groups run on separate threads via
//! `std::thread::scope`, selected by `txn_id % worker_count`.
//!
//! Index-management redo opcodes (`RenameIndex`, `DeleteIndex`, the
//! cursor-registration family) are not replayed here: the registry is
//! itself an ordinary B+tree whose committed state is already captured by
//! the checkpoint that runs right after this pass, so nothing beyond the
//! value-mutation opcodes needs re-deriving from the log.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::btree::Tree;
use crate::cache::NodeCache;
use crate::error::{Error, Result};
use crate::redo::{RedoOp, RedoRecord};
use crate::registry::Registry;
use crate::store::PageStore;

enum Op {
    Store { tree_id: u64, key: Vec<u8>, value: Vec<u8>, fragmented: bool },
    Delete { tree_id: u64, key: Vec<u8> },
}

pub fn encode_store(tree_id: u64, key: &[u8], value: &[u8], fragmented: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 1 + 4 + key.len() + value.len());
    out.write_u64::<LittleEndian>(tree_id).unwrap();
    out.push(if fragmented { 1 } else { 0 });
    out.write_u32::<LittleEndian>(key.len() as u32).unwrap();
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

pub fn encode_delete(tree_id: u64, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 1 + 4 + key.len());
    out.write_u64::<LittleEndian>(tree_id).unwrap();
    out.push(2); // delete marker, distinct from the store opcode's 0/1 fragmented flag
    out.write_u32::<LittleEndian>(key.len() as u32).unwrap();
    out.extend_from_slice(key);
    out
}

fn decode_op(payload: &[u8]) -> Result<Op> {
    let mut b = payload;
    let tree_id = b
        .read_u64::<LittleEndian>()
        .map_err(|_| Error::CorruptStore("redo payload truncated before tree id".into()))?;
    let marker = b
        .read_u8()
        .map_err(|_| Error::CorruptStore("redo payload truncated before marker".into()))?;
    let key_len = b
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::CorruptStore("redo payload truncated before key length".into()))? as usize;
    if b.len() < key_len {
        return Err(Error::CorruptStore("redo payload truncated before key".into()));
    }
    let key = b[..key_len].to_vec();
    let rest = &b[key_len..];
    match marker {
        2 => Ok(Op::Delete { tree_id, key }),
        0 | 1 => Ok(Op::Store { tree_id, key, value: rest.to_vec(), fragmented: marker == 1 }),
        other => Err(Error::CorruptStore(format!("unknown redo value-op marker {other}"))),
    }
}

pub(crate) fn tree_for(
    store: &Arc<PageStore>,
    cache: &Arc<NodeCache>,
    registry: &Registry,
    open_trees: &RwLock<HashMap<u64, Arc<Tree>>>,
    tree_id: u64,
) -> Result<Arc<Tree>> {
    if let Some(tree) = open_trees.read().unwrap().get(&tree_id).cloned() {
        return Ok(tree);
    }
    let (root, _name) = registry
        .root_and_name_by_id(tree_id)?
        .ok_or_else(|| Error::CorruptStore(format!("redo references unknown tree id {tree_id}")))?;
    let tree = Arc::new(Tree::open(store.clone(), cache.clone(), root));
    open_trees.write().unwrap().insert(tree_id, tree.clone());
    Ok(tree)
}

fn apply_txn_records(
    store: &Arc<PageStore>,
    cache: &Arc<NodeCache>,
    registry: &Registry,
    open_trees: &RwLock<HashMap<u64, Arc<Tree>>>,
    records: &[RedoRecord],
) -> Result<()> {
    let committed = records.iter().any(|r| r.opcode == RedoOp::TxnCommitFinal);
    if !committed {
        return Ok(());
    }
    for rec in records {
        match rec.opcode {
            RedoOp::TxnStore
            | RedoOp::TxnStoreCommit
            | RedoOp::TxnStoreCommitFinal
            | RedoOp::StoreNoLock
            | RedoOp::CursorStore => match decode_op(&rec.payload)? {
                Op::Store { tree_id, key, value, fragmented } => {
                    tree_for(store, cache, registry, open_trees, tree_id)?.insert(&key, &value, fragmented)?;
                }
                Op::Delete { tree_id, key } => {
                    tree_for(store, cache, registry, open_trees, tree_id)?.delete(&key)?;
                }
            },
            _ => {}
        }
    }
    Ok(())
}

/// Re-apply every committed transaction's recorded writes. A transaction
/// whose redo stream never reaches a `TxnCommitFinal` record is left
/// alone entirely: it either rolled back or never finished, so nothing it
/// wrote should resurface.
///
/// Returns the set of transaction ids that reached either
/// `TxnCommitFinal` or `TxnRollbackFinal` in this redo stream — i.e. ones
/// that definitely concluded before the crash, which the caller can use
/// to tell a stale durable-undo-index entry that was actually resolved
/// apart from one that genuinely needs undoing.
pub fn replay(
    records: Vec<RedoRecord>,
    store: &Arc<PageStore>,
    cache: &Arc<NodeCache>,
    registry: &Registry,
    open_trees: &RwLock<HashMap<u64, Arc<Tree>>>,
    highest_txn_id: &AtomicU64,
    worker_count: usize,
) -> Result<HashSet<u64>> {
    let worker_count = worker_count.max(1);
    let mut by_txn: HashMap<u64, Vec<RedoRecord>> = HashMap::new();
    let mut terminal_txns: HashSet<u64> = HashSet::new();
    for rec in records {
        let Some(txn_id) = rec.txn_id else { continue };
        highest_txn_id.fetch_max(txn_id, Ordering::SeqCst);
        if matches!(rec.opcode, RedoOp::TxnCommitFinal | RedoOp::TxnRollbackFinal) {
            terminal_txns.insert(txn_id);
        }
        by_txn.entry(txn_id).or_default().push(rec);
    }

    let mut buckets: Vec<Vec<(u64, Vec<RedoRecord>)>> = (0..worker_count).map(|_| Vec::new()).collect();
    for (txn_id, recs) in by_txn {
        buckets[(txn_id as usize) % worker_count].push((txn_id, recs));
    }

    let errors: Mutex<Vec<Error>> = Mutex::new(Vec::new());
    std::thread::scope(|scope| {
        for bucket in buckets {
            let store = store.clone();
            let cache = cache.clone();
            let registry = &*registry;
            let open_trees = &*open_trees;
            let errors = &errors;
            scope.spawn(move || {
                for (_txn_id, recs) in bucket {
                    if let Err(e) = apply_txn_records(&store, &cache, registry, open_trees, &recs) {
                        errors.lock().unwrap().push(e);
                    }
                }
            });
        }
    });

    let mut errs = errors.into_inner().unwrap();
    match errs.pop() {
        Some(e) => Err(e),
        None => Ok(terminal_txns),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::redo::RedoLog;

    #[test]
    fn replays_committed_store_and_skips_uncommitted() {
        let config = Config::in_memory();
        let store = Arc::new(PageStore::open(&config).unwrap());
        let cache = Arc::new(NodeCache::new(config.page_size, 1 << 16, 1 << 20, 1 << 16, 4));
        let registry = Registry::create(store.clone(), cache.clone()).unwrap();
        let tree = Arc::new(Tree::create(store.clone(), cache.clone()).unwrap());
        let id = registry.create_index("t", tree.root()).unwrap();
        let open_trees = RwLock::new(HashMap::from([(id, tree.clone())]));

        let redo = RedoLog::create(None, true).unwrap();
        redo.append(RedoOp::TxnStore, Some(1), &encode_store(id, b"k1", b"v1", false)).unwrap();
        redo.append(RedoOp::TxnCommitFinal, Some(1), b"").unwrap();
        redo.append(RedoOp::TxnStore, Some(2), &encode_store(id, b"k2", b"v2", false)).unwrap();
        redo.append(RedoOp::TxnRollbackFinal, Some(2), b"").unwrap();

        let records = redo.replay(0).unwrap();
        let highest = AtomicU64::new(0);
        let terminal = replay(records, &store, &cache, &registry, &open_trees, &highest, 2).unwrap();

        assert_eq!(tree.get(b"k1").unwrap().unwrap().0, b"v1");
        assert!(tree.get(b"k2").unwrap().is_none());
        assert_eq!(highest.load(Ordering::SeqCst), 2);
        assert!(terminal.contains(&1));
        assert!(terminal.contains(&2));
    }
}
