use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::Database;

/// How aggressively redo records must reach stable storage before a commit
/// is acknowledged to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Redo bytes are forced to stable storage and acknowledged before commit returns.
    #[default]
    Sync,
    /// Redo bytes are flushed out of application buffers but not forced to disk.
    NoSync,
    /// Redo bytes may remain buffered in the process.
    NoFlush,
    /// No redo traffic at all. Used for internal and temporary trees.
    NoRedo,
}

/// Governs which shared/upgradable/exclusive transitions a transaction may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockUpgradeRule {
    /// Exclusive may only be requested after already holding upgradable.
    #[default]
    Strict,
    /// Shared may upgrade directly to upgradable when no other shared holder exists.
    Lenient,
    /// No upgrade-path checking at all.
    Unchecked,
}

/// `-1` (infinite), `0` (non-blocking) or a positive duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTimeout {
    Infinite,
    NonBlocking,
    Duration(Duration),
}

impl Default for LockTimeout {
    fn default() -> Self {
        LockTimeout::Duration(Duration::from_secs(10))
    }
}

/// Builder for opening a [`Database`].
///
/// Mirrors the enumerated configuration surface in the specification: every
/// field below corresponds to one entry there, plus a handful of additions
/// (`checkpoint_size_threshold`, `checkpoint_interval`, `frag_cache_shards`,
/// `deadlock_scan_limit`) the specification's layered design leaves as
/// implementation choices.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) base_file: Option<PathBuf>,
    pub(crate) data_files: Vec<PathBuf>,
    pub(crate) page_size: usize,
    pub(crate) min_cached_bytes: usize,
    pub(crate) max_cached_bytes: usize,
    pub(crate) flush_threshold_bytes: i64,
    pub(crate) durability_mode: DurabilityMode,
    pub(crate) lock_timeout: LockTimeout,
    pub(crate) lock_upgrade_rule: LockUpgradeRule,
    pub(crate) read_only: bool,
    pub(crate) mkdirs: bool,
    pub(crate) file_sync: bool,
    pub(crate) checkpoint_size_threshold: u64,
    pub(crate) checkpoint_interval: Duration,
    pub(crate) frag_cache_shards: Option<usize>,
    pub(crate) deadlock_scan_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_file: None,
            data_files: Vec::new(),
            page_size: 4096,
            min_cached_bytes: 1 << 20,
            max_cached_bytes: 64 << 20,
            flush_threshold_bytes: 1 << 20,
            durability_mode: DurabilityMode::Sync,
            lock_timeout: LockTimeout::default(),
            lock_upgrade_rule: LockUpgradeRule::Strict,
            read_only: false,
            mkdirs: false,
            file_sync: false,
            checkpoint_size_threshold: 16 << 20,
            checkpoint_interval: Duration::from_secs(60),
            frag_cache_shards: None,
            deadlock_scan_limit: 1024,
        }
    }
}

impl Config {
    /// Start a builder for a file-backed store at `base_file`.
    ///
    /// The data file defaults to `{base_file}.db` unless overridden with
    /// [`Config::data_files`].
    pub fn new(base_file: impl AsRef<Path>) -> Self {
        Config {
            base_file: Some(base_file.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    /// Start a builder for an anonymous, non-durable in-memory store.
    ///
    /// Useful for tests and for purely transient indexes; `durability_mode`
    /// is forced to [`DurabilityMode::NoRedo`] since there is nothing to
    /// recover from.
    pub fn in_memory() -> Self {
        let mut cfg = Config::default();
        cfg.durability_mode = DurabilityMode::NoRedo;
        cfg
    }

    pub fn data_files(mut self, files: impl IntoIterator<Item = PathBuf>) -> Self {
        self.data_files = files.into_iter().collect();
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn cache_bytes(mut self, min: usize, max: usize) -> Self {
        self.min_cached_bytes = min;
        self.max_cached_bytes = max;
        self
    }

    pub fn flush_threshold_bytes(mut self, bytes: i64) -> Self {
        self.flush_threshold_bytes = bytes;
        self
    }

    pub fn durability_mode(mut self, mode: DurabilityMode) -> Self {
        self.durability_mode = mode;
        self
    }

    pub fn lock_timeout(mut self, timeout: LockTimeout) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn lock_upgrade_rule(mut self, rule: LockUpgradeRule) -> Self {
        self.lock_upgrade_rule = rule;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn mkdirs(mut self, mkdirs: bool) -> Self {
        self.mkdirs = mkdirs;
        self
    }

    pub fn file_sync(mut self, file_sync: bool) -> Self {
        self.file_sync = file_sync;
        self
    }

    pub fn checkpoint_size_threshold(mut self, bytes: u64) -> Self {
        self.checkpoint_size_threshold = bytes;
        self
    }

    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn frag_cache_shards(mut self, shards: usize) -> Self {
        self.frag_cache_shards = Some(shards.next_power_of_two());
        self
    }

    pub fn deadlock_scan_limit(mut self, limit: usize) -> Self {
        self.deadlock_scan_limit = limit;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.page_size < 512 || self.page_size > 65536 || !self.page_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "page_size {} must be a power of two between 512 and 65536",
                self.page_size
            )));
        }
        if self.min_cached_bytes > self.max_cached_bytes {
            return Err(Error::InvalidArgument(
                "min_cached_bytes must not exceed max_cached_bytes".into(),
            ));
        }
        Ok(())
    }

    fn resolved_data_path(&self) -> Option<PathBuf> {
        if !self.data_files.is_empty() {
            return Some(self.data_files[0].clone());
        }
        self.base_file.as_ref().map(|base| {
            let mut p = base.as_os_str().to_os_string();
            p.push(".db");
            PathBuf::from(p)
        })
    }

    pub(crate) fn data_path(&self) -> Option<PathBuf> {
        self.resolved_data_path()
    }

    pub(crate) fn frag_shard_count(&self) -> usize {
        self.frag_cache_shards.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .saturating_mul(16)
                .next_power_of_two()
        })
    }

    /// Open (or create) the database described by this configuration.
    pub fn open(self) -> Result<Database> {
        self.validate()?;
        Database::open(self)
    }
}
