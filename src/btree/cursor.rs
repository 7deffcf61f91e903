//! Ordered iteration over a [`Tree`], positioned by key rather than by a
//! sibling-pointer chain: moving to the next or previous entry re-descends
//! from the root for the key immediately after (or before) the current one.
//! Correct because the leaf a descent lands on is, by the B+tree separator
//! invariant, the unique leaf whose range can hold that key.
//!
//! Grounded on `crab-dads`' `btree::reader::Reader` cursor shape, adapted
//! to this crate's key-driven re-descent instead of a parent-frame stack.

use super::{layout, Tree};
use crate::error::{Error, Result};

/// Where a seek should land relative to the target key.
#[derive(Clone, Copy)]
enum Seek {
    Ge,
    Gt,
    Le,
    Lt,
}

pub struct Cursor<'t> {
    tree: &'t Tree,
    key: Option<Vec<u8>>,
}

impl<'t> Cursor<'t> {
    pub fn new(tree: &'t Tree) -> Self {
        Cursor { tree, key: None }
    }

    fn land(&mut self, key: Option<Vec<u8>>) {
        self.key = key;
    }

    fn seek(&mut self, target: &[u8], mode: Seek) -> Result<()> {
        let leaf = self.tree.descend_to_leaf(target)?;
        let _g = leaf.latch.lock_shared();
        let buf = leaf.buf.lock().unwrap();
        let n = layout::key_count(&buf);
        let idx = match layout::search(&buf, target, true) {
            Ok(i) => match mode {
                Seek::Ge | Seek::Le => Some(i),
                Seek::Gt => {
                    if i + 1 < n {
                        Some(i + 1)
                    } else {
                        None
                    }
                }
                Seek::Lt => {
                    if i > 0 {
                        Some(i - 1)
                    } else {
                        None
                    }
                }
            },
            Err(i) => match mode {
                Seek::Ge | Seek::Gt => {
                    if i < n {
                        Some(i)
                    } else {
                        None
                    }
                }
                Seek::Le | Seek::Lt => {
                    if i > 0 {
                        Some(i - 1)
                    } else {
                        None
                    }
                }
            },
        };
        self.land(idx.map(|i| layout::leaf_key_at(&buf, i).to_vec()));
        Ok(())
    }

    pub fn first(&mut self) -> Result<()> {
        let leaf = self.tree.descend_leftmost()?;
        let _g = leaf.latch.lock_shared();
        let buf = leaf.buf.lock().unwrap();
        self.land(if layout::key_count(&buf) > 0 {
            Some(layout::leaf_key_at(&buf, 0).to_vec())
        } else {
            None
        });
        Ok(())
    }

    pub fn last(&mut self) -> Result<()> {
        let leaf = self.tree.descend_rightmost()?;
        let _g = leaf.latch.lock_shared();
        let buf = leaf.buf.lock().unwrap();
        let n = layout::key_count(&buf);
        self.land(if n > 0 {
            Some(layout::leaf_key_at(&buf, n - 1).to_vec())
        } else {
            None
        });
        Ok(())
    }

    pub fn find(&mut self, key: &[u8]) -> Result<()> {
        self.seek(key, Seek::Ge)
    }

    pub fn find_ge(&mut self, key: &[u8]) -> Result<()> {
        self.seek(key, Seek::Ge)
    }

    pub fn find_gt(&mut self, key: &[u8]) -> Result<()> {
        self.seek(key, Seek::Gt)
    }

    pub fn find_le(&mut self, key: &[u8]) -> Result<()> {
        self.seek(key, Seek::Le)
    }

    pub fn find_lt(&mut self, key: &[u8]) -> Result<()> {
        self.seek(key, Seek::Lt)
    }

    /// Same as [`Cursor::find`]; the specification's fast same-leaf path is
    /// not distinguished from a full descent here, since descents are cheap
    /// latch-coupled reads against the resident node cache.
    pub fn find_nearby(&mut self, key: &[u8]) -> Result<()> {
        self.find(key)
    }

    pub fn next(&mut self) -> Result<()> {
        match self.key.take() {
            None => self.first(),
            Some(k) => self.seek(&k, Seek::Gt),
        }
    }

    pub fn previous(&mut self) -> Result<()> {
        match self.key.take() {
            None => self.last(),
            Some(k) => self.seek(&k, Seek::Lt),
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn is_positioned(&self) -> bool {
        self.key.is_some()
    }

    /// Load the value (and fragmentation flag) at the current position.
    pub fn load(&self) -> Result<(Vec<u8>, bool)> {
        let key = self.key.as_deref().ok_or(Error::UnpositionedCursor)?;
        match self.tree.get(key)? {
            Some(v) => Ok(v),
            None => Err(Error::UnpositionedCursor),
        }
    }

    pub fn store(&self, value: &[u8], fragmented: bool) -> Result<()> {
        let key = self.key.as_deref().ok_or(Error::UnpositionedCursor)?;
        self.tree.insert(key, value, fragmented)
    }

    pub fn delete(&mut self) -> Result<()> {
        let key = self.key.take().ok_or(Error::UnpositionedCursor)?;
        self.tree.delete(&key)?;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeCache;
    use crate::config::Config;
    use crate::store::PageStore;
    use std::sync::Arc;

    fn fresh_tree() -> (Arc<PageStore>, Arc<NodeCache>, Tree) {
        let config = Config::in_memory();
        let store = Arc::new(PageStore::open(&config).unwrap());
        let cache = Arc::new(NodeCache::new(config.page_size, 1 << 16, 1 << 20, 1 << 16, 4));
        let tree = Tree::create(store.clone(), cache.clone()).unwrap();
        (store, cache, tree)
    }

    #[test]
    fn iterate_in_order() {
        let (_store, _cache, tree) = fresh_tree();
        for k in [b'c', b'a', b'b'] {
            tree.insert(&[k], &[k], false).unwrap();
        }
        let mut cursor = Cursor::new(&tree);
        cursor.first().unwrap();
        let mut seen = Vec::new();
        while cursor.is_positioned() {
            seen.push(cursor.key().unwrap().to_vec());
            cursor.next().unwrap();
        }
        assert_eq!(seen, vec![vec![b'a'], vec![b'b'], vec![b'c']]);
    }

    #[test]
    fn find_ge_and_lt() {
        let (_store, _cache, tree) = fresh_tree();
        for k in [1u8, 3, 5, 7] {
            tree.insert(&[k], &[k], false).unwrap();
        }
        let mut cursor = Cursor::new(&tree);
        cursor.find_ge(&[4]).unwrap();
        assert_eq!(cursor.key(), Some(&[5u8][..]));
        cursor.find_lt(&[5]).unwrap();
        assert_eq!(cursor.key(), Some(&[3u8][..]));
    }
}
