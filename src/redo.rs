//! L5 — the append-only, segmented redo log.
//!
//! Grounded on `fhenrywells-mini-aurora`'s `crates/wal` for the overall
//! shape (numbered segment files, self-delimiting checksummed records,
//! `flush`/`sync` kept distinct), adapted to synchronous `std::fs` I/O
//! since this crate carries no async runtime.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Redo opcodes, per the specification's external-interfaces opcode list.
/// Order is significant only within a single transaction's record stream,
/// not as a numeric encoding contract, so the discriminants below are an
/// implementation detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RedoOp {
    Timestamp = 1,
    Shutdown = 2,
    Close = 3,
    EndFile = 4,
    Reset = 5,
    TxnEnter = 6,
    TxnRollback = 7,
    TxnRollbackFinal = 8,
    TxnCommit = 9,
    TxnCommitFinal = 10,
    TxnStore = 11,
    TxnStoreCommit = 12,
    TxnStoreCommitFinal = 13,
    StoreNoLock = 14,
    RenameIndex = 15,
    DeleteIndex = 16,
    CursorRegister = 17,
    CursorUnregister = 18,
    CursorStore = 19,
    CursorFind = 20,
    CursorValueSetLength = 21,
    CursorValueWrite = 22,
    CursorValueClear = 23,
    TxnLockShared = 24,
    TxnLockUpgradable = 25,
    TxnLockExclusive = 26,
    TxnCustom = 27,
    TxnCustomLock = 28,
    Control = 29,
}

impl RedoOp {
    fn from_u8(b: u8) -> Result<Self> {
        use RedoOp::*;
        Ok(match b {
            1 => Timestamp,
            2 => Shutdown,
            3 => Close,
            4 => EndFile,
            5 => Reset,
            6 => TxnEnter,
            7 => TxnRollback,
            8 => TxnRollbackFinal,
            9 => TxnCommit,
            10 => TxnCommitFinal,
            11 => TxnStore,
            12 => TxnStoreCommit,
            13 => TxnStoreCommitFinal,
            14 => StoreNoLock,
            15 => RenameIndex,
            16 => DeleteIndex,
            17 => CursorRegister,
            18 => CursorUnregister,
            19 => CursorStore,
            20 => CursorFind,
            21 => CursorValueSetLength,
            22 => CursorValueWrite,
            23 => CursorValueClear,
            24 => TxnLockShared,
            25 => TxnLockUpgradable,
            26 => TxnLockExclusive,
            27 => TxnCustom,
            28 => TxnCustomLock,
            29 => Control,
            other => return Err(Error::CorruptStore(format!("unknown redo opcode {other}"))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RedoRecord {
    pub opcode: RedoOp,
    pub txn_id: Option<u64>,
    pub payload: Vec<u8>,
    /// Byte position within the logical (cross-segment) redo stream.
    pub position: u64,
}

enum Sink {
    File { dir: PathBuf, base: String, file: BufWriter<File>, segment: u64 },
    Memory { segments: Vec<Vec<u8>> },
}

pub struct RedoLog {
    sink: std::sync::Mutex<Sink>,
    position: std::sync::atomic::AtomicU64,
    enabled: bool,
}

fn segment_path(dir: &Path, base: &str, segment: u64) -> PathBuf {
    dir.join(format!("{base}.redo.{segment}"))
}

impl RedoLog {
    /// `base_path`: `Some(path)` for a durable, file-backed log (segments
    /// live alongside it as `<path>.redo.<N>`); `None` for a purely
    /// in-memory log (used for `Config::in_memory()` / `NoRedo`).
    pub fn create(base_path: Option<&Path>, enabled: bool) -> Result<Self> {
        let sink = match base_path {
            Some(path) => {
                let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
                let base = path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "wyrmkv".to_string());
                let segment = 0;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(segment_path(&dir, &base, segment))?;
                Sink::File { dir, base, file: BufWriter::new(file), segment }
            }
            None => Sink::Memory { segments: vec![Vec::new()] },
        };
        Ok(RedoLog {
            sink: std::sync::Mutex::new(sink),
            position: std::sync::atomic::AtomicU64::new(0),
            enabled,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn encode_record(opcode: RedoOp, txn_id: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(1 + 9 + payload.len());
        body.push(opcode as u8);
        match txn_id {
            Some(id) => {
                body.push(1);
                body.write_u64::<LittleEndian>(id).unwrap();
            }
            None => body.push(0),
        }
        body.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        body.extend_from_slice(payload);
        let crc = crc32fast::hash(&body);

        let mut framed = Vec::with_capacity(4 + body.len() + 4);
        framed.write_u32::<LittleEndian>(body.len() as u32).unwrap();
        framed.extend_from_slice(&body);
        framed.write_u32::<LittleEndian>(crc).unwrap();
        framed
    }

    /// Append one record, returning its logical stream position.
    pub fn append(&self, opcode: RedoOp, txn_id: Option<u64>, payload: &[u8]) -> Result<u64> {
        if !self.enabled {
            return Ok(self.position.load(std::sync::atomic::Ordering::SeqCst));
        }
        let framed = Self::encode_record(opcode, txn_id, payload);
        let pos = self
            .position
            .fetch_add(framed.len() as u64, std::sync::atomic::Ordering::SeqCst);
        let mut sink = self.sink.lock().unwrap();
        match &mut *sink {
            Sink::File { file, .. } => {
                file.write_all(&framed)?;
            }
            Sink::Memory { segments } => {
                segments.last_mut().unwrap().extend_from_slice(&framed);
            }
        }
        Ok(pos)
    }

    pub fn flush(&self) -> Result<()> {
        if let Sink::File { file, .. } = &mut *self.sink.lock().unwrap() {
            file.flush()?;
        }
        Ok(())
    }

    pub fn sync(&self, metadata: bool) -> Result<()> {
        self.flush()?;
        if let Sink::File { file, .. } = &mut *self.sink.lock().unwrap() {
            let f = file.get_ref();
            if metadata {
                f.sync_all()?;
            } else {
                f.sync_data()?;
            }
        }
        Ok(())
    }

    /// Roll to a fresh segment file ahead of a checkpoint switch.
    pub fn checkpoint_prepare(&self) -> Result<()> {
        self.flush()?;
        let mut sink = self.sink.lock().unwrap();
        match &mut *sink {
            Sink::File { dir, base, file, segment } => {
                *segment += 1;
                let new_file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(segment_path(dir, base, *segment))?;
                *file = BufWriter::new(new_file);
            }
            Sink::Memory { segments } => segments.push(Vec::new()),
        }
        Ok(())
    }

    /// Record the checkpoint marker `{number, position, txn_id}` — the
    /// caller persists this triple into the commit header's extra data.
    pub fn checkpoint_switch(&self, checkpoint_number: u64, txn_id: u64) -> (u64, u64, u64) {
        (checkpoint_number, self.position.load(std::sync::atomic::Ordering::SeqCst), txn_id)
    }

    /// Permit segments strictly older than `keep_from_segment` to be
    /// deleted now that the checkpoint referencing them has committed.
    pub fn checkpoint_finished(&self, keep_from_segment: u64) -> Result<()> {
        let sink = self.sink.lock().unwrap();
        if let Sink::File { dir, base, segment, .. } = &*sink {
            for old in 0..keep_from_segment.min(*segment) {
                let _ = fs::remove_file(segment_path(dir, base, old));
            }
        }
        Ok(())
    }

    pub fn current_position(&self) -> u64 {
        self.position.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Replay every record at or after `from_position`, across all
    /// segments from `from_segment` onward, in file order.
    pub fn replay(&self, from_segment: u64) -> Result<Vec<RedoRecord>> {
        let mut out = Vec::new();
        let mut pos: u64 = 0;
        let sink = self.sink.lock().unwrap();
        match &*sink {
            Sink::File { dir, base, segment, .. } => {
                for seg in from_segment..=*segment {
                    let path = segment_path(dir, base, seg);
                    let Ok(mut f) = File::open(&path) else { continue };
                    let mut bytes = Vec::new();
                    f.read_to_end(&mut bytes)?;
                    pos = Self::parse_records(&bytes, pos, &mut out)?;
                }
            }
            Sink::Memory { segments } => {
                for seg in segments.iter().skip(from_segment as usize) {
                    pos = Self::parse_records(seg, pos, &mut out)?;
                }
            }
        }
        Ok(out)
    }

    fn parse_records(bytes: &[u8], mut pos: u64, out: &mut Vec<RedoRecord>) -> Result<u64> {
        let mut cursor = &bytes[..];
        while !cursor.is_empty() {
            if cursor.len() < 4 {
                break; // trailing torn write from a crash mid-append
            }
            let start_pos = pos;
            let body_len = cursor.read_u32::<LittleEndian>()? as usize;
            pos += 4;
            if cursor.len() < body_len + 4 {
                break;
            }
            let body = &cursor[..body_len];
            let crc_stored = (&cursor[body_len..body_len + 4]).read_u32::<LittleEndian>()?;
            if crc32fast::hash(body) != crc_stored {
                break; // torn record at the tail; stop replay here
            }
            let mut b = body;
            let opcode = RedoOp::from_u8(b.read_u8()?)?;
            let has_txn = b.read_u8()?;
            let txn_id = if has_txn == 1 { Some(b.read_u64::<LittleEndian>()?) } else { None };
            let payload_len = b.read_u32::<LittleEndian>()? as usize;
            let payload = b[..payload_len].to_vec();
            out.push(RedoRecord { opcode, txn_id, payload, position: start_pos });
            let consumed = 4 + body_len + 4;
            cursor = &cursor[consumed..];
            pos += (body_len + 4) as u64;
        }
        Ok(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_replay_round_trip() {
        let log = RedoLog::create(None, true).unwrap();
        log.append(RedoOp::TxnEnter, Some(1), b"").unwrap();
        log.append(RedoOp::TxnStore, Some(1), b"hello").unwrap();
        log.append(RedoOp::TxnCommitFinal, Some(1), b"").unwrap();

        let records = log.replay(0).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].opcode, RedoOp::TxnStore);
        assert_eq!(records[1].payload, b"hello");
        assert_eq!(records[1].txn_id, Some(1));
    }

    #[test]
    fn disabled_log_records_nothing() {
        let log = RedoLog::create(None, false).unwrap();
        log.append(RedoOp::TxnStore, Some(1), b"x").unwrap();
        assert!(log.replay(0).unwrap().is_empty());
    }

    #[test]
    fn checkpoint_prepare_rotates_segment() {
        let log = RedoLog::create(None, true).unwrap();
        log.append(RedoOp::TxnEnter, Some(1), b"").unwrap();
        log.checkpoint_prepare().unwrap();
        log.append(RedoOp::TxnCommitFinal, Some(1), b"").unwrap();
        let records = log.replay(0).unwrap();
        assert_eq!(records.len(), 2);
        let records_from_second = log.replay(1).unwrap();
        assert_eq!(records_from_second.len(), 1);
    }
}
