//! One datalog segment: an append-only record file plus its meta sidecar.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::file::MmapFile;
use crate::files;
use crate::record::{RecordKind, SegmentReader};

/// Bookkeeping carried in the `.psg.meta` sidecar.
///
/// The meta is advisory: it speeds up open and steers compaction, but the
/// segment itself is the source of truth and the counters can be rebuilt by
/// scanning it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SegmentMeta {
    /// No further appends are allowed once set.
    pub full: bool,
    /// Number of put records written to the segment.
    pub put_records: u32,
    /// Number of delete records written to the segment.
    pub delete_records: u32,
    /// Put records shadowed by a later put or delete.
    pub deleted_keys: u32,
    /// Bytes of records whose content is obsolete.
    pub deleted_bytes: u32,
}

/// An open segment file.
#[derive(Debug)]
pub(crate) struct Segment {
    pub file: MmapFile,
    /// Slot in the datalog's segment table; reused after removal.
    pub id: u16,
    /// Monotonic creation counter; governs replay and compaction order.
    pub sequence_id: u64,
    pub meta: SegmentMeta,
}

impl Segment {
    /// Open or create the segment file, loading the meta sidecar when it is
    /// present and intact, and rebuilding the counters from the records
    /// otherwise (unless the caller will replay the log anyway).
    pub fn open(dir: &Path, id: u16, sequence_id: u64, rebuild_meta: bool) -> Result<Self> {
        let path = files::db_path(dir, &files::segment_name(id, sequence_id));
        let file = MmapFile::open(&path)?;
        let mut segment = Self {
            file,
            id,
            sequence_id,
            meta: SegmentMeta::default(),
        };
        if !segment.file.empty() {
            match crate::metafile::read_meta_file(&segment.meta_path(dir)) {
                Ok(meta) => segment.meta = meta,
                Err(err) if rebuild_meta => {
                    log::warn!(
                        "rebuilding meta for segment {}: {}",
                        segment.file.path().display(),
                        err
                    );
                    segment.rebuild_meta()?;
                }
                Err(_) => {}
            }
        }
        Ok(segment)
    }

    /// Path of the meta sidecar.
    pub fn meta_path(&self, dir: &Path) -> PathBuf {
        files::db_path(dir, &files::segment_meta_name(self.id, self.sequence_id))
    }

    /// Current size of the data file, header included.
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Append encoded record bytes, returning the record offset.
    pub fn append(&mut self, data: &[u8]) -> Result<u32> {
        debug_assert!(!self.meta.full);
        let off = self.file.append(data)?;
        Ok(off as u32)
    }

    /// A sequential reader over the segment's records, on an independent
    /// file descriptor.
    pub fn reader(&self) -> Result<SegmentReader> {
        SegmentReader::new(self.file.try_clone()?, self.id, self.file.size())
    }

    /// Persist the meta sidecar.
    pub fn write_meta(&self, dir: &Path) -> Result<()> {
        crate::metafile::write_meta_file(&self.meta_path(dir), &self.meta)
    }

    /// Recount the record counters by scanning the data file.
    ///
    /// Shadowing relationships against other segments are not visible here,
    /// so `deleted_keys` and overwrite bytes restart at zero; delete records
    /// still account for their own bytes.
    fn rebuild_meta(&mut self) -> Result<()> {
        let mut meta = SegmentMeta::default();
        let mut reader = self.reader()?;
        loop {
            match reader.next() {
                Ok(Some(rec)) => match rec.kind {
                    RecordKind::Put => meta.put_records += 1,
                    RecordKind::Delete => {
                        meta.delete_records += 1;
                        meta.deleted_bytes += rec.data.len() as u32;
                    }
                },
                Ok(None) => break,
                // A torn tail will be handled by recovery; count what's valid.
                Err(_) => break,
            }
        }
        self.meta = meta;
        Ok(())
    }
}
