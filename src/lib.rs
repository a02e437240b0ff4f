#![deny(missing_docs)]

//! An embedded key-value store for opaque byte keys and values.
//!
//! The store owns one directory.  Writes append `put` and `delete` records
//! to a log split into fixed-ceiling segment files; an on-disk hash table
//! (linear hashing, one bucket split at a time, see
//! <https://en.wikipedia.org/wiki/Linear_hashing>) maps 32-bit key hashes to
//! record locations, giving O(1)-average point lookups without touching the
//! log.  Every record carries a CRC32 checksum (via
//! <https://github.com/srijs/rust-crc32fast>), which is what lets crash
//! recovery rebuild the index from the log and cut off torn tails.
//!
//! One process opens a database at a time (a lock file enforces this);
//! within the process a single writer and any number of readers may run
//! concurrently.  There is no ordered iteration and no multi-key atomicity.
//!
//! ```no_run
//! use burrowdb::{Db, Options};
//!
//! let db = Db::open("my-db", Options::default())?;
//! db.put(b"species", b"burrowing owl")?;
//! if let Some(value) = db.get(b"species")? {
//!     assert_eq!(value, b"burrowing owl");
//! }
//! db.delete(b"species")?;
//! db.close()?;
//! # Ok::<(), burrowdb::Error>(())
//! ```

mod backup;
mod compaction;
mod datalog;
mod db;
mod error;
mod file;
mod files;
mod flock;
mod hash;
mod index;
mod iterator;
mod metafile;
mod metrics;
mod options;
mod record;
mod recovery;
mod segment;

pub use compaction::CompactionResult;
pub use db::Db;
pub use error::{Error, Result};
pub use iterator::ItemIterator;
pub use metrics::Metrics;
pub use options::{Options, SyncPolicy};
pub use record::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
