//! The 512-byte header prefix carried by pages 0 and 1, per the byte table
//! in the specification's external-interfaces section.
//!
//! Grounded on the teacher's `TwoArrayTrailer` (`pages/header.rs`) for the
//! idiom of a small packed struct with accessor methods rather than raw
//! field pokes, though the byte offsets themselves come directly from the
//! specification's file format.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::page::PageId;

pub const MAGIC: u64 = 0x7772_6d6b_765f_4442; // "wrmkv_DB" in ASCII, little endian friendly
pub const HEADER_SIZE: usize = 512;

const OFF_MAGIC: usize = 0;
const OFF_PAGE_SIZE: usize = 8;
const OFF_COMMIT_NUMBER: usize = 12;
const OFF_CRC: usize = 16;
const OFF_MANAGER: usize = 20;
const MANAGER_LEN: usize = 140;
// bytes [160, 256) reserved
const OFF_EXTRA: usize = 256;
const EXTRA_LEN: usize = 256;

const OFF_EXTRA_ENCODING_VERSION: usize = 0;
const OFF_EXTRA_REGISTRY_ROOT: usize = 4;
const OFF_EXTRA_MASTER_UNDO: usize = 12;
const OFF_EXTRA_HIGHEST_TXN: usize = 20;
const OFF_EXTRA_REDO_CHECKPOINT_NUM: usize = 28;
const OFF_EXTRA_REDO_CHECKPOINT_TXN: usize = 36;
const OFF_EXTRA_REDO_CHECKPOINT_POS: usize = 44;
const OFF_EXTRA_REPLICATION_TAG: usize = 52;

/// The page-manager sub-header: free-list roots and page count.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerHeader {
    pub page_count: u64,
    pub free_list_head: PageId,
    pub free_list_len: u64,
}

impl ManagerHeader {
    fn encode(&self, dest: &mut [u8]) {
        LittleEndian::write_u64(&mut dest[0..8], self.page_count);
        LittleEndian::write_u64(&mut dest[8..16], self.free_list_head);
        LittleEndian::write_u64(&mut dest[16..24], self.free_list_len);
    }

    fn decode(src: &[u8]) -> Self {
        ManagerHeader {
            page_count: LittleEndian::read_u64(&src[0..8]),
            free_list_head: LittleEndian::read_u64(&src[8..16]),
            free_list_len: LittleEndian::read_u64(&src[16..24]),
        }
    }
}

/// The "extra commit data" reserved for higher layers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtraCommitData {
    pub encoding_version: u32,
    pub registry_root: PageId,
    pub master_undo_log_head: PageId,
    pub highest_txn_id: u64,
    pub redo_checkpoint_number: u64,
    pub redo_checkpoint_txn_id: u64,
    pub redo_checkpoint_position: u64,
    pub replication_encoding_tag: u64,
}

impl ExtraCommitData {
    fn encode(&self, dest: &mut [u8]) {
        LittleEndian::write_u32(
            &mut dest[OFF_EXTRA_ENCODING_VERSION..OFF_EXTRA_ENCODING_VERSION + 4],
            self.encoding_version,
        );
        LittleEndian::write_u64(
            &mut dest[OFF_EXTRA_REGISTRY_ROOT..OFF_EXTRA_REGISTRY_ROOT + 8],
            self.registry_root,
        );
        LittleEndian::write_u64(
            &mut dest[OFF_EXTRA_MASTER_UNDO..OFF_EXTRA_MASTER_UNDO + 8],
            self.master_undo_log_head,
        );
        LittleEndian::write_u64(
            &mut dest[OFF_EXTRA_HIGHEST_TXN..OFF_EXTRA_HIGHEST_TXN + 8],
            self.highest_txn_id,
        );
        LittleEndian::write_u64(
            &mut dest[OFF_EXTRA_REDO_CHECKPOINT_NUM..OFF_EXTRA_REDO_CHECKPOINT_NUM + 8],
            self.redo_checkpoint_number,
        );
        LittleEndian::write_u64(
            &mut dest[OFF_EXTRA_REDO_CHECKPOINT_TXN..OFF_EXTRA_REDO_CHECKPOINT_TXN + 8],
            self.redo_checkpoint_txn_id,
        );
        LittleEndian::write_u64(
            &mut dest[OFF_EXTRA_REDO_CHECKPOINT_POS..OFF_EXTRA_REDO_CHECKPOINT_POS + 8],
            self.redo_checkpoint_position,
        );
        LittleEndian::write_u64(
            &mut dest[OFF_EXTRA_REPLICATION_TAG..OFF_EXTRA_REPLICATION_TAG + 8],
            self.replication_encoding_tag,
        );
    }

    fn decode(src: &[u8]) -> Self {
        ExtraCommitData {
            encoding_version: LittleEndian::read_u32(
                &src[OFF_EXTRA_ENCODING_VERSION..OFF_EXTRA_ENCODING_VERSION + 4],
            ),
            registry_root: LittleEndian::read_u64(
                &src[OFF_EXTRA_REGISTRY_ROOT..OFF_EXTRA_REGISTRY_ROOT + 8],
            ),
            master_undo_log_head: LittleEndian::read_u64(
                &src[OFF_EXTRA_MASTER_UNDO..OFF_EXTRA_MASTER_UNDO + 8],
            ),
            highest_txn_id: LittleEndian::read_u64(
                &src[OFF_EXTRA_HIGHEST_TXN..OFF_EXTRA_HIGHEST_TXN + 8],
            ),
            redo_checkpoint_number: LittleEndian::read_u64(
                &src[OFF_EXTRA_REDO_CHECKPOINT_NUM..OFF_EXTRA_REDO_CHECKPOINT_NUM + 8],
            ),
            redo_checkpoint_txn_id: LittleEndian::read_u64(
                &src[OFF_EXTRA_REDO_CHECKPOINT_TXN..OFF_EXTRA_REDO_CHECKPOINT_TXN + 8],
            ),
            redo_checkpoint_position: LittleEndian::read_u64(
                &src[OFF_EXTRA_REDO_CHECKPOINT_POS..OFF_EXTRA_REDO_CHECKPOINT_POS + 8],
            ),
            replication_encoding_tag: LittleEndian::read_u64(
                &src[OFF_EXTRA_REPLICATION_TAG..OFF_EXTRA_REPLICATION_TAG + 8],
            ),
        }
    }
}

/// One of the two 512-byte header slots.
#[derive(Debug, Clone)]
pub struct Header {
    pub page_size: u32,
    pub commit_number: u32,
    pub manager: ManagerHeader,
    pub extra: ExtraCommitData,
}

impl Header {
    pub fn new(page_size: u32) -> Self {
        Header {
            page_size,
            commit_number: 0,
            manager: ManagerHeader::default(),
            extra: ExtraCommitData::default(),
        }
    }

    /// Serialize into a full page-sized buffer (only the first 512 bytes are
    /// meaningful; the remainder, if any, is left untouched by the caller).
    pub fn encode(&self, dest: &mut [u8]) {
        assert!(dest.len() >= HEADER_SIZE);
        LittleEndian::write_u64(&mut dest[OFF_MAGIC..OFF_MAGIC + 8], MAGIC);
        LittleEndian::write_u32(&mut dest[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4], self.page_size);
        LittleEndian::write_u32(
            &mut dest[OFF_COMMIT_NUMBER..OFF_COMMIT_NUMBER + 4],
            self.commit_number,
        );
        LittleEndian::write_u32(&mut dest[OFF_CRC..OFF_CRC + 4], 0);
        self.manager
            .encode(&mut dest[OFF_MANAGER..OFF_MANAGER + MANAGER_LEN]);
        self.extra.encode(&mut dest[OFF_EXTRA..OFF_EXTRA + EXTRA_LEN]);
        let crc = crc32fast::hash(&dest[0..HEADER_SIZE]);
        LittleEndian::write_u32(&mut dest[OFF_CRC..OFF_CRC + 4], crc);
    }

    /// Validate and decode a header slot. Returns `Err` if the magic number
    /// doesn't match or the CRC-32 over the first 512 bytes fails.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(Error::CorruptStore("header slot shorter than 512 bytes".into()));
        }
        let magic = LittleEndian::read_u64(&src[OFF_MAGIC..OFF_MAGIC + 8]);
        if magic != MAGIC {
            return Err(Error::CorruptStore(format!(
                "bad magic number: 0x{magic:016x}"
            )));
        }
        let stored_crc = LittleEndian::read_u32(&src[OFF_CRC..OFF_CRC + 4]);
        let mut check = [0u8; HEADER_SIZE];
        check.copy_from_slice(&src[0..HEADER_SIZE]);
        LittleEndian::write_u32(&mut check[OFF_CRC..OFF_CRC + 4], 0);
        let computed = crc32fast::hash(&check);
        if computed != stored_crc {
            return Err(Error::CorruptStore(
                "header CRC-32 mismatch".into(),
            ));
        }
        let page_size = LittleEndian::read_u32(&src[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4]);
        let commit_number = LittleEndian::read_u32(&src[OFF_COMMIT_NUMBER..OFF_COMMIT_NUMBER + 4]);
        let manager = ManagerHeader::decode(&src[OFF_MANAGER..OFF_MANAGER + MANAGER_LEN]);
        let extra = ExtraCommitData::decode(&src[OFF_EXTRA..OFF_EXTRA + EXTRA_LEN]);
        Ok(Header {
            page_size,
            commit_number,
            manager,
            extra,
        })
    }
}

/// Compare two commit numbers modulo 2^32, per the specification: the
/// "newer" one is whichever makes `b.wrapping_sub(a)` a small positive
/// number rather than a small negative (large unsigned) one.
pub fn is_newer(candidate: u32, than: u32) -> bool {
    let diff = candidate.wrapping_sub(than) as i32;
    diff > 0
}

/// Pick the authoritative header out of the two slots read from disk.
pub fn choose_authoritative(
    a: Result<Header>,
    b: Result<Header>,
) -> Result<(usize, Header)> {
    match (a, b) {
        (Ok(a), Ok(b)) => {
            if a.commit_number == b.commit_number {
                return Err(Error::CorruptStore(
                    "both header slots report the same commit number".into(),
                ));
            }
            if is_newer(a.commit_number, b.commit_number) {
                Ok((0, a))
            } else {
                Ok((1, b))
            }
        }
        (Ok(a), Err(_)) => Ok((0, a)),
        (Err(_), Ok(b)) => Ok((1, b)),
        (Err(_), Err(_)) => Err(Error::CorruptStore(
            "both header slots failed validation".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut h = Header::new(4096);
        h.commit_number = 7;
        h.manager.page_count = 42;
        h.extra.registry_root = 3;
        let mut buf = vec![0u8; 4096];
        h.encode(&mut buf);
        let back = Header::decode(&buf).unwrap();
        assert_eq!(back.commit_number, 7);
        assert_eq!(back.manager.page_count, 42);
        assert_eq!(back.extra.registry_root, 3);
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let h = Header::new(4096);
        let mut buf = vec![0u8; 4096];
        h.encode(&mut buf);
        buf[100] ^= 0xFF;
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn commit_number_wraps_modulo_32() {
        assert!(is_newer(1, u32::MAX));
        assert!(!is_newer(u32::MAX, 1));
        assert!(is_newer(100, 50));
    }
}
