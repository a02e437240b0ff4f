//! Tunable parameters for opening a database.

use std::time::Duration;

/// When the database flushes written data to stable storage on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Never sync automatically; the caller drives [`crate::Db::sync`].
    Never,
    /// Sync at the end of every `put` and `delete`.
    Always,
    /// Sync periodically from the background worker, but only when
    /// modifications happened since the last run.
    Interval(Duration),
}

/// Options for opening a database.
///
/// The defaults match a general-purpose store; the compaction knobs are
/// mostly useful for tests and for workloads with unusually small values.
#[derive(Clone, Debug)]
pub struct Options {
    pub(crate) sync_policy: SyncPolicy,
    pub(crate) background_compaction_interval: Option<Duration>,
    pub(crate) max_segment_size: u32,
    pub(crate) compaction_min_segment_size: u32,
    pub(crate) compaction_min_fragmentation: f32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::Never,
            background_compaction_interval: None,
            max_segment_size: u32::MAX,
            compaction_min_segment_size: 32 << 20,
            compaction_min_fragmentation: 0.5,
        }
    }
}

impl Options {
    /// Create options with the default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the automatic sync policy.
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// Run a compaction pass from the background worker every `interval`.
    pub fn background_compaction_interval(mut self, interval: Duration) -> Self {
        self.background_compaction_interval = Some(interval);
        self
    }

    /// Set the byte ceiling of a single segment file (header included).
    pub fn max_segment_size(mut self, size: u32) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Segments smaller than this are never picked for compaction on their
    /// own (they may still be swept up behind a delete-bearing segment).
    pub fn compaction_min_segment_size(mut self, size: u32) -> Self {
        self.compaction_min_segment_size = size;
        self
    }

    /// Minimum `deleted_bytes / size` ratio for a segment to be compacted.
    /// Clamped to `[0, 1]`.
    pub fn compaction_min_fragmentation(mut self, fragmentation: f32) -> Self {
        self.compaction_min_fragmentation = fragmentation.clamp(0.0, 1.0);
        self
    }
}
