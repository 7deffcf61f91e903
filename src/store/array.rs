//! L0 — raw positioned reads/writes of fixed-size pages on a single memory-mapped file.
//!
//! Grounded on the teacher's `StorageInner` (`src/storage.rs`): one growable
//! memory map backing the whole file, grown in place via `MmapMut::remap`
//! where the platform allows it. Unlike the teacher, a single map is kept
//! (rather than a vector of maps) by always allowing the remap to move —
//! simpler for a page-id-addressed store where nothing holds a raw pointer
//! into the map across a grow.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs4::fs_std::FileExt;
use memmap2::{MmapMut, MmapOptions, RemapOptions};

use crate::error::{Error, Result};
use crate::page::PageId;

pub struct PageArray {
    file: Option<File>,
    map: Option<MmapMut>,
    page_size: usize,
    page_count: u64,
    file_sync: bool,
}

impl PageArray {
    /// Open (creating if necessary) a file-backed page array.
    pub fn open(path: &Path, page_size: usize, read_only: bool, file_sync: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .map_err(Error::Io)?;
        if !read_only {
            file.try_lock_exclusive().map_err(Error::Lock)?;
        } else {
            file.try_lock_shared().map_err(Error::Lock)?;
        }
        let len = file.metadata().map_err(Error::Io)?.len();
        let page_count = len / page_size as u64;
        let map = if len == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().len(len as usize).map_mut(&file)? })
        };
        Ok(PageArray {
            file: Some(file),
            map,
            page_size,
            page_count,
            file_sync,
        })
    }

    /// Create an anonymous, non-file-backed page array (used for `Config::in_memory`).
    pub fn anonymous(page_size: usize) -> Result<Self> {
        Ok(PageArray {
            file: None,
            map: None,
            page_size,
            page_count: 0,
            file_sync: false,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_empty(&self) -> bool {
        self.page_count == 0
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    fn offset(&self, id: PageId) -> usize {
        id as usize * self.page_size
    }

    fn ensure_mapped(&self, id: PageId) -> Result<()> {
        if id >= self.page_count {
            return Err(Error::InvalidArgument(format!(
                "page {id} is beyond the current page count {}",
                self.page_count
            )));
        }
        Ok(())
    }

    pub fn read(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        self.read_at(id, 0, buf)
    }

    pub fn read_at(&self, id: PageId, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.ensure_mapped(id)?;
        let map = self
            .map
            .as_ref()
            .ok_or_else(|| Error::CorruptStore("page array has no backing map".into()))?;
        let start = self.offset(id) + offset;
        if offset + buf.len() > self.page_size {
            return Err(Error::InvalidArgument("read beyond page bounds".into()));
        }
        buf.copy_from_slice(&map[start..start + buf.len()]);
        Ok(())
    }

    pub fn write(&mut self, id: PageId, buf: &[u8]) -> Result<()> {
        self.ensure_mapped(id)?;
        let start = self.offset(id);
        let map = self
            .map
            .as_mut()
            .ok_or_else(|| Error::CorruptStore("page array has no backing map".into()))?;
        map[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    /// Write, then immediately flush the affected range — the array's
    /// approximation of bypassing the OS page cache, since a memory map has
    /// no distinct "unbuffered write" path.
    pub fn write_durably(&mut self, id: PageId, buf: &[u8]) -> Result<()> {
        self.write(id, buf)?;
        let start = self.offset(id);
        if let Some(map) = self.map.as_ref() {
            map.flush_range(start, buf.len()).map_err(Error::Io)?;
        }
        if self.file_sync {
            if let Some(file) = self.file.as_ref() {
                file.sync_data().map_err(Error::Io)?;
            }
        }
        Ok(())
    }

    pub fn sync(&self, metadata: bool) -> Result<()> {
        if let Some(map) = self.map.as_ref() {
            map.flush().map_err(Error::Io)?;
        }
        if let Some(file) = self.file.as_ref() {
            if metadata {
                file.sync_all().map_err(Error::Io)?;
            } else {
                file.sync_data().map_err(Error::Io)?;
            }
        }
        Ok(())
    }

    /// Grow or shrink the array to hold exactly `count` pages.
    pub fn set_page_count(&mut self, count: u64) -> Result<()> {
        if count == self.page_count {
            return Ok(());
        }
        let new_len = count as usize * self.page_size;
        if let Some(file) = self.file.as_ref() {
            file.set_len(new_len as u64).map_err(Error::Io)?;
        }
        match self.map.take() {
            Some(mut map) => {
                if new_len == 0 {
                    self.map = None;
                } else {
                    unsafe {
                        map.remap(new_len, RemapOptions::new().may_move(true))
                            .map_err(Error::Io)?;
                    }
                    self.map = Some(map);
                }
            }
            None => {
                if new_len > 0 {
                    self.map = Some(match self.file.as_ref() {
                        Some(file) => unsafe { MmapOptions::new().len(new_len).map_mut(file)? },
                        None => MmapMut::map_anon(new_len).map_err(Error::Io)?,
                    });
                }
            }
        }
        self.page_count = count;
        Ok(())
    }

    pub fn truncate(&mut self, count: u64) -> Result<()> {
        self.set_page_count(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut arr = PageArray::open(&path, 4096, false, false).unwrap();
        assert!(arr.is_empty());
        arr.set_page_count(4).unwrap();
        assert_eq!(arr.page_count(), 4);
        let mut page = vec![0xAB; 4096];
        arr.write(2, &page).unwrap();
        let mut out = vec![0u8; 4096];
        arr.read(2, &mut out).unwrap();
        assert_eq!(out, page);
        page[0] = 0xCD;
        arr.write_durably(2, &page).unwrap();
        arr.sync(true).unwrap();
        arr.read(2, &mut out).unwrap();
        assert_eq!(out[0], 0xCD);
    }

    #[test]
    fn anonymous_array_round_trip() {
        let mut arr = PageArray::anonymous(512).unwrap();
        arr.set_page_count(2).unwrap();
        arr.write(1, &[7u8; 512]).unwrap();
        let mut out = vec![0u8; 512];
        arr.read(1, &mut out).unwrap();
        assert_eq!(out, vec![7u8; 512]);
    }
}
