//! Mutation path: preemptive-split insertion and plain deletion.
//!
//! Splits happen on the way down rather than being propagated back up
//! after the fact: before descending into a child, the child is split if
//! it wouldn't have room for this operation, with the parent (already
//! latched and already known to have room, by the same invariant applied
//! one level up) receiving the new separator immediately. This avoids
//! needing a parent-frame stack, at the cost of occasionally splitting a
//! node one step earlier than strictly necessary — the same trade made by
//! `crab-dads`' single-pass `BTreeWrite`.
//!
//! Underflow on delete is not rebalanced: entries are removed from their
//! leaf and nothing more. Sparser-than-ideal nodes remain correct, just
//! not reclaimed until a future insert's preemptive split visits them —
//! left as a known simplification rather than implementing merge.

use std::sync::Arc;

use super::{layout, Tree};
use crate::cache::{Node, NodeKind};
use crate::error::{Error, Result};
use crate::page::PageId;

fn node_needs_split(page_size: usize, node: &Arc<Node>, key: &[u8], value: &[u8]) -> bool {
    let buf = node.buf.lock().unwrap();
    if layout::is_leaf(&buf) {
        layout::leaf_needs_split(page_size, &buf, key, value)
    } else {
        layout::internal_needs_split(page_size, &buf)
    }
}

fn split_node(tree: &Tree, parent: &Arc<Node>, child: &Arc<Node>) -> Result<()> {
    let new_id = tree.store().alloc_page()?;
    let right = tree.cache().new_dirty_node(new_id)?;
    let is_leaf = { layout::is_leaf(&child.buf.lock().unwrap()) };
    let median = {
        let mut child_buf = child.buf.lock().unwrap();
        let mut right_buf = right.buf.lock().unwrap();
        if is_leaf {
            layout::leaf_split(&mut child_buf, &mut right_buf)
        } else {
            layout::internal_split(&mut child_buf, &mut right_buf)
        }
    };
    let kind = if is_leaf { NodeKind::Leaf } else { NodeKind::Internal };
    *right.kind.lock().unwrap() = kind;
    *child.kind.lock().unwrap() = kind;

    let mut parent_buf = parent.buf.lock().unwrap();
    if !layout::internal_try_insert(&mut parent_buf, &median, right.page_id()) {
        return Err(Error::CorruptStore(
            "parent had no room for a promoted separator despite the preemptive-split invariant".into(),
        ));
    }
    Ok(())
}

/// Ensure the root is dirtied for this checkpoint generation and, if it
/// wouldn't have room for this operation, split it — growing the tree by
/// one level with a fresh internal root whose two children are the old
/// root (now holding the left half) and a new right sibling.
fn prepare_root(tree: &Tree, key: &[u8], value: &[u8]) -> Result<Arc<Node>> {
    let page_size = tree.store().page_size();
    let root = tree.load_root()?;
    let _g = root.latch.lock_exclusive();
    tree.cache().make_dirty(tree.store(), &root)?;

    if !node_needs_split(page_size, &root, key, value) {
        return Ok(root);
    }

    let new_right_id = tree.store().alloc_page()?;
    let right = tree.cache().new_dirty_node(new_right_id)?;
    let is_leaf = { layout::is_leaf(&root.buf.lock().unwrap()) };
    let median = {
        let mut root_buf = root.buf.lock().unwrap();
        let mut right_buf = right.buf.lock().unwrap();
        if is_leaf {
            layout::leaf_split(&mut root_buf, &mut right_buf)
        } else {
            layout::internal_split(&mut root_buf, &mut right_buf)
        }
    };
    let kind = if is_leaf { NodeKind::Leaf } else { NodeKind::Internal };
    *right.kind.lock().unwrap() = kind;
    *root.kind.lock().unwrap() = kind;

    let new_root_id = tree.store().alloc_page()?;
    let new_root = tree.cache().new_dirty_node(new_root_id)?;
    {
        let mut new_root_buf = new_root.buf.lock().unwrap();
        layout::init_internal(&mut new_root_buf, root.page_id());
        if !layout::internal_try_insert(&mut new_root_buf, &median, right.page_id()) {
            return Err(Error::CorruptStore("fresh root had no room for its first separator".into()));
        }
    }
    *new_root.kind.lock().unwrap() = NodeKind::Internal;
    tree.set_root(new_root.page_id());
    Ok(new_root)
}

pub fn insert(tree: &Tree, key: &[u8], value: &[u8], fragmented: bool) -> Result<()> {
    let _serial = tree.lock_writer();
    let page_size = tree.store().page_size();

    let mut current = prepare_root(tree, key, value)?;
    let mut current_guard = current.latch.lock_exclusive();

    loop {
        let is_leaf = { let buf = current.buf.lock().unwrap(); layout::is_leaf(&buf) };
        if is_leaf {
            let mut buf = current.buf.lock().unwrap();
            if !layout::leaf_try_insert(&mut buf, key, value, fragmented)? {
                return Err(Error::InvalidArgument(
                    "entry did not fit in its leaf even after a preemptive split".into(),
                ));
            }
            return Ok(());
        }

        let child_id = { let buf = current.buf.lock().unwrap(); layout::internal_child_for_key(&buf, key) };
        let mut child = tree.cache().load(tree.store(), child_id)?;
        let mut child_guard = child.latch.lock_exclusive();
        let id_changed = tree.cache().make_dirty(tree.store(), &child)?;
        if id_changed {
            repoint(&current, child_id, child.page_id());
        }

        if node_needs_split(page_size, &child, key, value) {
            split_node(tree, &current, &child)?;
            drop(child_guard);
            let child_id2 = { let buf = current.buf.lock().unwrap(); layout::internal_child_for_key(&buf, key) };
            child = tree.cache().load(tree.store(), child_id2)?;
            child_guard = child.latch.lock_exclusive();
        }

        drop(current_guard);
        current = child;
        current_guard = child_guard;
    }
}

pub fn delete(tree: &Tree, key: &[u8]) -> Result<bool> {
    let _serial = tree.lock_writer();

    let mut current = tree.load_root()?;
    {
        let _g = current.latch.lock_exclusive();
        tree.cache().make_dirty(tree.store(), &current)?;
    }
    let mut current_guard = current.latch.lock_exclusive();

    loop {
        let is_leaf = { let buf = current.buf.lock().unwrap(); layout::is_leaf(&buf) };
        if is_leaf {
            let mut buf = current.buf.lock().unwrap();
            return layout::leaf_delete(&mut buf, key);
        }

        let child_id = { let buf = current.buf.lock().unwrap(); layout::internal_child_for_key(&buf, key) };
        let child = tree.cache().load(tree.store(), child_id)?;
        let child_guard = child.latch.lock_exclusive();
        let id_changed = tree.cache().make_dirty(tree.store(), &child)?;
        if id_changed {
            repoint(&current, child_id, child.page_id());
        }

        drop(current_guard);
        current = child;
        current_guard = child_guard;
    }
}

fn repoint(parent: &Arc<Node>, old_id: PageId, new_id: PageId) {
    let mut buf = parent.buf.lock().unwrap();
    layout::internal_repoint(&mut buf, old_id, new_id);
}

#[cfg(test)]
mod tests {
    use crate::cache::NodeCache;
    use crate::config::Config;
    use crate::store::PageStore;
    use std::sync::Arc;

    use super::super::Tree;

    fn small_tree() -> Tree {
        // A tiny page size forces splits after only a handful of inserts.
        let config = Config::in_memory().page_size(512);
        let store = Arc::new(PageStore::open(&config).unwrap());
        let cache = Arc::new(NodeCache::new(512, 1 << 16, 1 << 20, 1 << 16, 4));
        Tree::create(store, cache).unwrap()
    }

    #[test]
    fn many_inserts_force_splits_and_stay_findable() {
        let tree = small_tree();
        for i in 0..200u32 {
            let k = i.to_be_bytes();
            tree.insert(&k, &k, false).unwrap();
        }
        for i in 0..200u32 {
            let k = i.to_be_bytes();
            let (v, frag) = tree.get(&k).unwrap().unwrap();
            assert_eq!(v, k.to_vec());
            assert!(!frag);
        }
    }

    #[test]
    fn delete_removes_entry() {
        let tree = small_tree();
        tree.insert(b"a", b"1", false).unwrap();
        tree.insert(b"b", b"2", false).unwrap();
        assert!(tree.delete(b"a").unwrap());
        assert!(tree.get(b"a").unwrap().is_none());
        assert_eq!(tree.get(b"b").unwrap().unwrap().0, b"2");
    }

    #[test]
    fn overwrite_replaces_value() {
        let tree = small_tree();
        tree.insert(b"k", b"v1", false).unwrap();
        tree.insert(b"k", b"v2", false).unwrap();
        assert_eq!(tree.get(b"k").unwrap().unwrap().0, b"v2");
    }
}
