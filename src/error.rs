use thiserror::Error;

/// Every error the crate can return.
///
/// Lock-wait outcomes (timeout, deadlock, illegal upgrade) from an explicit
/// `lock_shared`/`lock_upgradable`/`lock_exclusive` call are *not*
/// represented here: they are routine, expected results a caller branches
/// on, and are returned as plain values (see [`crate::lock::LockResult`]).
/// Operations that acquire locks automatically on the caller's behalf
/// (`Index::load`, `store`, `insert`, ...) have nowhere to return that value
/// to, so they surface the same outcome wrapped in [`Error::LockFailed`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The backing file's header(s), free list, or a page failed validation.
    #[error("store is corrupt: {0}")]
    CorruptStore(String),

    /// No evictable node was found within the bounded eviction walk.
    #[error("node cache exhausted: no evictable node found in {attempts} attempts")]
    CacheExhausted { attempts: usize },

    /// The backing file could not be extended any further.
    #[error("store is full: could not allocate page (page count {page_count})")]
    StoreFull { page_count: u64 },

    /// An I/O operation on the backing file failed.
    #[error("I/O error")]
    Io(#[source] std::io::Error),

    /// Couldn't take the advisory exclusive lock on the backing file.
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),

    /// An index handle was used after it was closed.
    #[error("index is closed")]
    ClosedIndex,

    /// The database handle was used after it was closed (possibly via panic-close).
    #[error("database is closed: {cause}")]
    ClosedDatabase { cause: String },

    /// A key exceeded the maximum encodable length.
    #[error("key of {len} bytes exceeds the maximum of {max} bytes")]
    LargeKey { len: usize, max: usize },

    /// A value exceeded the maximum encodable length.
    #[error("value of {len} bytes exceeds the maximum of {max} bytes")]
    LargeValue { len: usize, max: usize },

    /// A cursor operation required a positioned cursor.
    #[error("cursor is not positioned over a key")]
    UnpositionedCursor,

    /// A caller-supplied argument was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A lock acquired automatically on the caller's behalf was not granted.
    #[error("lock not acquired: {0:?}")]
    LockFailed(crate::lock::LockResult),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
