//! Error type shared by every database operation.

use std::io;

/// Errors returned by database operations.
///
/// `Corrupted` is terminal for the operation that hit it everywhere except
/// inside crash recovery, which uses it to find the last valid byte of a
/// segment.  `Busy` is safe to retry once the running compaction finishes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The database directory is locked by another live process.
    #[error("database directory is locked by another process")]
    Locked,

    /// A compaction is already in progress.
    #[error("compaction already in progress")]
    Busy,

    /// The index already holds the maximum number of keys.
    #[error("maximum number of keys reached")]
    Full,

    /// Every segment id is occupied; nothing can be allocated.
    #[error("all segment ids are in use")]
    SegmentsExhausted,

    /// The key exceeds the maximum key length.
    #[error("key exceeds maximum length")]
    KeyTooLarge,

    /// The value exceeds the maximum value length or cannot fit a segment.
    #[error("value exceeds maximum length")]
    ValueTooLarge,

    /// Checksum mismatch, bad magic, bad format version or an index entry
    /// pointing outside its segment.
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// An error from the underlying file system.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corrupted(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
