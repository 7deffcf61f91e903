//! The registry: tree id → root page id, plus the name↔id key-map and the
//! trash set used by index deletion. Implemented as a single internal
//! B+tree over tagged fixed/variable keys rather than a parallel
//! structure, since [`crate::btree::Tree`] already does everything an
//! ordered map needs.
//!
//! Key layout (all keys are tag byte + payload, compared lexicographically
//! so each tag forms its own contiguous range):
//!
//! - `0x00`                    → next unallocated tree id (8-byte value)
//! - `0x01 ++ name bytes`      → tree id (8-byte value)
//! - `0x02 ++ id (8 BE bytes)` → root page id (8-byte value) ++ name (rest)
//! - `0x03 ++ id (8 BE bytes)` → name bytes (presence marks the id as trash)

use std::sync::Arc;

use crate::btree::Tree;
use crate::cache::NodeCache;
use crate::error::{Error, Result};
use crate::page::PageId;
use crate::store::PageStore;

const TAG_NEXT_ID: u8 = 0x00;
const TAG_NAME: u8 = 0x01;
const TAG_ID: u8 = 0x02;
const TAG_TRASH: u8 = 0x03;

const NEXT_ID_KEY: [u8; 1] = [TAG_NEXT_ID];

fn name_key(name: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + name.len());
    k.push(TAG_NAME);
    k.extend_from_slice(name.as_bytes());
    k
}

fn id_key(id: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(9);
    k.push(TAG_ID);
    k.extend_from_slice(&id.to_be_bytes());
    k
}

fn trash_key(id: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(9);
    k.push(TAG_TRASH);
    k.extend_from_slice(&id.to_be_bytes());
    k
}

fn encode_id_value(root: PageId, name: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(8 + name.len());
    v.extend_from_slice(&root.to_be_bytes());
    v.extend_from_slice(name.as_bytes());
    v
}

fn decode_id_value(buf: &[u8]) -> Result<(PageId, String)> {
    if buf.len() < 8 {
        return Err(Error::CorruptStore("registry id-entry shorter than 8 bytes".into()));
    }
    let root = PageId::from_be_bytes(buf[0..8].try_into().unwrap());
    let name = String::from_utf8(buf[8..].to_vec())
        .map_err(|_| Error::CorruptStore("registry entry name is not valid UTF-8".into()))?;
    Ok((root, name))
}

/// Reserved id of the registry tree itself: it is addressed directly by the
/// header's `registry_root` field, never looked up through itself.
pub const REGISTRY_TREE_ID: u64 = 0;

pub struct Registry {
    tree: Tree,
}

impl Registry {
    pub fn create(store: Arc<PageStore>, cache: Arc<NodeCache>) -> Result<Self> {
        let tree = Tree::create(store, cache)?;
        let registry = Registry { tree };
        registry.tree.insert(&NEXT_ID_KEY, &1u64.to_be_bytes(), false)?;
        Ok(registry)
    }

    pub fn open(store: Arc<PageStore>, cache: Arc<NodeCache>, root: PageId) -> Self {
        Registry { tree: Tree::open(store, cache, root) }
    }

    pub fn root(&self) -> PageId {
        self.tree.root()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Allocate the next tree id, persisting the bumped counter.
    pub fn allocate_id(&self) -> Result<u64> {
        let (bytes, _) = self
            .tree
            .get(&NEXT_ID_KEY)?
            .ok_or_else(|| Error::CorruptStore("registry missing next-id counter".into()))?;
        let id = u64::from_be_bytes(bytes[..8].try_into().unwrap());
        self.tree.insert(&NEXT_ID_KEY, &(id + 1).to_be_bytes(), false)?;
        Ok(id)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<u64>> {
        match self.tree.get(&name_key(name))? {
            Some((bytes, _)) => Ok(Some(u64::from_be_bytes(bytes[..8].try_into().unwrap()))),
            None => Ok(None),
        }
    }

    pub fn root_and_name_by_id(&self, id: u64) -> Result<Option<(PageId, String)>> {
        match self.tree.get(&id_key(id))? {
            Some((bytes, _)) => Ok(Some(decode_id_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Register a brand-new index: reserves its name/id pair and its first
    /// root pointer.
    pub fn create_index(&self, name: &str, root: PageId) -> Result<u64> {
        if self.find_by_name(name)?.is_some() {
            return Err(Error::InvalidArgument(format!("index '{name}' already exists")));
        }
        let id = self.allocate_id()?;
        self.tree.insert(&name_key(name), &id.to_be_bytes(), false)?;
        self.tree.insert(&id_key(id), &encode_id_value(root, name), false)?;
        Ok(id)
    }

    /// Update the persisted root pointer for an already-registered index.
    pub fn set_root(&self, id: u64, root: PageId) -> Result<()> {
        let (_, name) = self
            .root_and_name_by_id(id)?
            .ok_or_else(|| Error::CorruptStore(format!("registry has no entry for tree id {id}")))?;
        self.tree.insert(&id_key(id), &encode_id_value(root, &name), false)?;
        Ok(())
    }

    pub fn rename(&self, id: u64, new_name: &str) -> Result<()> {
        if self.find_by_name(new_name)?.is_some() {
            return Err(Error::InvalidArgument(format!("index '{new_name}' already exists")));
        }
        let (root, old_name) = self
            .root_and_name_by_id(id)?
            .ok_or_else(|| Error::CorruptStore(format!("registry has no entry for tree id {id}")))?;
        self.tree.delete(&name_key(&old_name))?;
        self.tree.insert(&name_key(new_name), &id.to_be_bytes(), false)?;
        self.tree.insert(&id_key(id), &encode_id_value(root, new_name), false)?;
        Ok(())
    }

    /// Move an index to the trash prefix: its name/id entries are removed so
    /// the name is free to reuse immediately, but the id→root mapping (and a
    /// trash marker) remain until the background drain finishes.
    pub fn mark_trash(&self, id: u64) -> Result<()> {
        let (_, name) = self
            .root_and_name_by_id(id)?
            .ok_or_else(|| Error::CorruptStore(format!("registry has no entry for tree id {id}")))?;
        self.tree.delete(&name_key(&name))?;
        self.tree.insert(&trash_key(id), name.as_bytes(), false)?;
        Ok(())
    }

    /// Once a trashed tree has been fully drained, remove it from the
    /// registry entirely.
    pub fn finish_trash(&self, id: u64) -> Result<()> {
        self.tree.delete(&trash_key(id))?;
        self.tree.delete(&id_key(id))?;
        Ok(())
    }

    /// All tree ids currently parked in the trash, resumed at startup.
    pub fn list_trash(&self) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        let mut cursor = crate::btree::Cursor::new(&self.tree);
        cursor.find_ge(&[TAG_TRASH])?;
        while let Some(key) = cursor.key() {
            if key.first() != Some(&TAG_TRASH) {
                break;
            }
            let id = u64::from_be_bytes(key[1..9].try_into().unwrap());
            out.push(id);
            cursor.next()?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeCache;
    use crate::config::Config;
    use crate::store::PageStore;

    fn fresh_registry() -> (Arc<PageStore>, Arc<NodeCache>, Registry) {
        let config = Config::in_memory();
        let store = Arc::new(PageStore::open(&config).unwrap());
        let cache = Arc::new(NodeCache::new(config.page_size, 1 << 16, 1 << 20, 1 << 16, 4));
        let registry = Registry::create(store.clone(), cache.clone()).unwrap();
        (store, cache, registry)
    }

    #[test]
    fn create_find_and_rename() {
        let (_s, _c, reg) = fresh_registry();
        let id = reg.create_index("users", 42).unwrap();
        assert_eq!(reg.find_by_name("users").unwrap(), Some(id));
        let (root, name) = reg.root_and_name_by_id(id).unwrap().unwrap();
        assert_eq!(root, 42);
        assert_eq!(name, "users");

        reg.rename(id, "accounts").unwrap();
        assert_eq!(reg.find_by_name("users").unwrap(), None);
        assert_eq!(reg.find_by_name("accounts").unwrap(), Some(id));
    }

    #[test]
    fn trash_lifecycle() {
        let (_s, _c, reg) = fresh_registry();
        let id = reg.create_index("temp", 7).unwrap();
        reg.mark_trash(id).unwrap();
        assert_eq!(reg.find_by_name("temp").unwrap(), None);
        assert_eq!(reg.list_trash().unwrap(), vec![id]);
        reg.finish_trash(id).unwrap();
        assert!(reg.root_and_name_by_id(id).unwrap().is_none());
        assert!(reg.list_trash().unwrap().is_empty());
    }

    #[test]
    fn duplicate_name_rejected() {
        let (_s, _c, reg) = fresh_registry();
        reg.create_index("dup", 1).unwrap();
        assert!(reg.create_index("dup", 2).is_err());
    }
}
