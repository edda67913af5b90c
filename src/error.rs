use thiserror::Error;

/// Errors produced by any layer of the storage engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PagewalError {
    /// The underlying filesystem or memory map returned an error.
    #[error("I/O failure")]
    IoFailure(#[source] std::io::Error),

    /// An operation was attempted on a storage, access manager, or WAL past
    /// its `close()`.
    #[error("storage is closed")]
    StorageClosed,

    /// An offset was negative-equivalent or beyond the logical size of the
    /// storage being read.
    #[error("offset 0x{offset:x} with length {len} is out of bounds (size 0x{size:x})")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    /// A transaction's write-set intersected another transaction that
    /// committed after it started.
    #[error("write-write conflict detected at commit")]
    Conflict,

    /// The log anchor's magic/version did not match, or a record checksum
    /// failed to verify before reaching a torn tail.
    #[error("data corruption: {0}")]
    Corruption(&'static str),

    /// An operation was attempted on a transaction (or other stateful
    /// object) whose current state forbids it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl From<std::io::Error> for PagewalError {
    fn from(e: std::io::Error) -> Self {
        PagewalError::IoFailure(e)
    }
}

/// Convenience alias for this crate's fallible results.
pub type Result<T> = std::result::Result<T, PagewalError>;
