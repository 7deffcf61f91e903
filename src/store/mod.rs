//! L1 — page allocation, deferred delete, recycling, and the dual-header
//! atomic commit protocol.

pub mod array;
pub mod freelist;
pub mod header;

use std::path::Path;
use std::sync::{Mutex, RwLock};

use log::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::page::PageId;

pub use header::Header;

use array::PageArray;
use freelist::FreeList;

/// Callback invoked by [`PageStore::commit`] to let the caller (the
/// checkpointer) fill in the extra commit data and guarantee all relevant
/// dirty pages have already been written via [`PageStore::write_page`].
pub trait CommitPrepare {
    fn prepare(&mut self, header: &mut Header) -> Result<()>;
}

struct Mutable {
    array: PageArray,
    free_list: FreeList,
    commit_number: u32,
    active_slot: usize,
    page_size: usize,
    extra: header::ExtraCommitData,
}

/// The page store's commit lock: held shared by every structural tree
/// mutation, briefly exclusive by the checkpointer while it swaps the
/// commit-state bit, and briefly exclusive by `close`.
pub struct PageStore {
    inner: RwLock<Mutable>,
    /// Serializes checkpoint attempts; separate from `inner`'s RwLock so a
    /// checkpoint's exclusive section is the only time tree mutators block.
    commit_serializer: Mutex<()>,
    /// The specification's "commit lock": held shared by every structural
    /// tree mutation, held exclusive briefly by checkpoint (to swap the
    /// commit-state bit) and by close. Distinct from `inner`, which just
    /// protects this struct's own bookkeeping (free list, page count).
    commit_lock: RwLock<()>,
}

impl PageStore {
    pub fn open(config: &Config) -> Result<Self> {
        let page_size = config.page_size;
        let array = match config.data_path() {
            Some(path) => Self::open_array(&path, page_size, config.read_only, config.file_sync)?,
            None => PageArray::anonymous(page_size)?,
        };
        Self::from_array(array, page_size)
    }

    fn open_array(path: &Path, page_size: usize, read_only: bool, file_sync: bool) -> Result<PageArray> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        PageArray::open(path, page_size, read_only, file_sync)
    }

    fn from_array(mut array: PageArray, page_size: usize) -> Result<Self> {
        if array.is_empty() {
            array.set_page_count(2)?;
            let mut h0 = Header::new(page_size as u32);
            h0.commit_number = 0;
            h0.manager.page_count = 2;
            let mut buf = vec![0u8; page_size];
            h0.encode(&mut buf);
            array.write_durably(0, &buf)?;
            let h1 = h0.clone();
            let mut buf1 = vec![0u8; page_size];
            let mut h1 = h1;
            h1.commit_number = 0;
            h1.encode(&mut buf1);
            array.write_durably(1, &buf1)?;
            array.sync(true)?;
            return Ok(PageStore {
                inner: RwLock::new(Mutable {
                    array,
                    free_list: FreeList::new(),
                    commit_number: 0,
                    active_slot: 0,
                    page_size,
                    extra: header::ExtraCommitData::default(),
                }),
                commit_serializer: Mutex::new(()),
                commit_lock: RwLock::new(()),
            });
        }

        let mut buf0 = vec![0u8; page_size];
        array.read(0, &mut buf0)?;
        let mut buf1 = vec![0u8; page_size];
        array.read(1, &mut buf1)?;
        let h0 = Header::decode(&buf0);
        let h1 = Header::decode(&buf1);
        let (slot, header) = header::choose_authoritative(h0, h1)?;
        if header.page_size as usize != page_size {
            return Err(Error::CorruptStore(format!(
                "configured page size {page_size} disagrees with stored page size {}",
                header.page_size
            )));
        }
        let free_list = if header.manager.free_list_head == 0 {
            FreeList::new()
        } else {
            let head = header.manager.free_list_head;
            let read_array = &array;
            let mut scratch = vec![0u8; page_size];
            FreeList::decode(head, page_size, move |id| {
                read_array.read(id, &mut scratch).expect("free list chain page read");
                scratch.clone()
            })
        };
        debug!(
            "opened page store: commit_number={} page_count={} free_list_len={}",
            header.commit_number,
            header.manager.page_count,
            free_list.len()
        );
        Ok(PageStore {
            inner: RwLock::new(Mutable {
                array,
                free_list,
                commit_number: header.commit_number,
                active_slot: slot,
                page_size,
                extra: header.extra,
            }),
            commit_serializer: Mutex::new(()),
            commit_lock: RwLock::new(()),
        })
    }

    pub fn page_size(&self) -> usize {
        self.inner.read().unwrap().page_size
    }

    pub fn commit_number(&self) -> u32 {
        self.inner.read().unwrap().commit_number
    }

    pub fn extra(&self) -> header::ExtraCommitData {
        self.inner.read().unwrap().extra
    }

    /// Acquire the commit lock shared — the mode every structural tree
    /// mutation uses while it dirties nodes and allocates pages.
    pub fn commit_lock_shared(&self) -> std::sync::RwLockReadGuard<'_, ()> {
        self.commit_lock.read().unwrap()
    }

    /// Acquire the commit lock exclusive — used only by checkpoint (to swap
    /// the commit-state bit) and by close. No other latch may be acquired
    /// while holding this.
    pub fn commit_lock_exclusive(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        self.commit_lock.write().unwrap()
    }

    pub fn alloc_page(&self) -> Result<PageId> {
        let mut inner = self.inner.write().unwrap();
        if let Some(id) = inner.free_list.alloc() {
            return Ok(id);
        }
        let id = inner.array.page_count();
        inner.array.set_page_count(id + 1)?;
        Ok(id)
    }

    pub fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        self.inner.write().unwrap().array.write(id, buf)
    }

    pub fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        self.inner.read().unwrap().array.read(id, buf)
    }

    /// Schedule `id` to be freed only after the next successful commit.
    pub fn delete_page(&self, id: PageId) {
        self.inner.write().unwrap().free_list.defer_delete(id);
    }

    /// `id` was reserved but never part of a committed image: reusable at once.
    pub fn recycle_page(&self, id: PageId) {
        self.inner.write().unwrap().free_list.recycle(id);
    }

    pub fn page_count(&self) -> u64 {
        self.inner.read().unwrap().array.page_count()
    }

    /// Run the dual-header atomic commit protocol.
    ///
    /// `callback.prepare` must arrange for every dirty page this commit
    /// references to already be durable via `write_page` before it returns.
    pub fn commit(&self, mut callback: impl CommitPrepare) -> Result<u32> {
        let _serial = self.commit_serializer.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        let next_commit = inner.commit_number.wrapping_add(1);
        let next_slot = (inner.active_slot + 1) % 2;

        let mut header = Header::new(inner.page_size as u32);
        header.commit_number = next_commit;
        header.manager.page_count = inner.array.page_count();

        let pages_needed = inner.free_list.pages_needed(inner.page_size);
        while inner.free_list.chain_pages.len() < pages_needed {
            let id = inner.array.page_count();
            inner.array.set_page_count(id + 1)?;
            inner.free_list.chain_pages.push(id);
        }
        let chain_pages = inner.free_list.chain_pages[..pages_needed].to_vec();
        header.manager.free_list_head = chain_pages.first().copied().unwrap_or(0);
        header.manager.free_list_len = inner.free_list.len() as u64;
        let encoded_chain = inner.free_list.encode(inner.page_size, &chain_pages);

        callback.prepare(&mut header)?;
        inner.extra = header.extra;

        for (id, buf) in encoded_chain {
            inner.array.write(id, &buf)?;
        }
        inner.array.sync(false)?;

        let mut buf = vec![0u8; inner.page_size];
        header.encode(&mut buf);
        inner.array.write_durably(next_slot as u64, &buf)?;
        inner.array.sync(false)?;

        {
            // The only moment the commit-state bit itself flips: briefly
            // exclusive so no tree mutator observes a half-swapped state.
            let _commit_excl = self.commit_lock.write().unwrap();
            inner.commit_number = next_commit;
            inner.active_slot = next_slot;
            inner.free_list.rotate_after_commit();
        }
        debug!("commit {next_commit} completed, slot={next_slot}");
        Ok(next_commit)
    }

    pub fn sync(&self, metadata: bool) -> Result<()> {
        self.inner.read().unwrap().array.sync(metadata)
    }

    pub fn close(&self) -> Result<()> {
        let _commit_excl = self.commit_lock.write().unwrap();
        let inner = self.inner.write().unwrap();
        match inner.array.sync(true) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("error syncing page store on close: {e}");
                Err(e)
            }
        }
    }
}
