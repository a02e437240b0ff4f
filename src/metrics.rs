//! Operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters over the lifetime of one open database handle.
#[derive(Debug, Default)]
pub struct Metrics {
    pub(crate) puts: AtomicU64,
    pub(crate) deletes: AtomicU64,
    pub(crate) gets: AtomicU64,
    pub(crate) hash_collisions: AtomicU64,
}

impl Metrics {
    /// Number of `put` calls.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of `delete` calls.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Number of `get` calls.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of lookups that had to skip a slot whose hash matched but
    /// whose key did not.
    pub fn hash_collisions(&self) -> u64 {
        self.hash_collisions.load(Ordering::Relaxed)
    }
}
