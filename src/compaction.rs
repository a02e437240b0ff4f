//! Online segment compaction.
//!
//! Compaction rewrites the still-live records of fragmented segments into
//! the active tail of the datalog and deletes the sources.  The write lock
//! is taken once per record rather than for the whole pass, trading a longer
//! compaction for bounded writer latency.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::db::{Db, Shared, State};
use crate::error::{Error, Result};
use crate::index::Slot;
use crate::record::{Record, RecordKind};

/// Outcome of a [`Db::compact`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Number of segments rewritten and removed.
    pub compacted_segments: usize,
    /// Obsolete records discarded (overwritten or deleted puts, tombstones).
    pub reclaimed_records: usize,
    /// Bytes of those records.
    pub reclaimed_bytes: u64,
}

/// Clears the compaction-running flag when the pass ends, error or not.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Db {
    /// Reclaim space held by overwritten and deleted records.
    ///
    /// At most one compaction runs at a time; a concurrent call fails with
    /// [`Error::Busy`].  The observable contents of the database are
    /// unchanged.
    pub fn compact(&self) -> Result<CompactionResult> {
        self.shared.compact()
    }
}

impl Shared {
    pub(crate) fn compact(&self) -> Result<CompactionResult> {
        if self
            .compaction_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }
        let _running = RunningGuard(&self.compaction_running);
        let _maintenance = self.maintenance.lock();

        let picked = {
            let state = self.state.read();
            pick_for_compaction(&state, self.opts.compaction_min_segment_size, self.opts.compaction_min_fragmentation)
        };

        let mut result = CompactionResult::default();
        for id in picked {
            let segment_result = self.compact_segment(id)?;
            result.compacted_segments += 1;
            result.reclaimed_records += segment_result.reclaimed_records;
            result.reclaimed_bytes += segment_result.reclaimed_bytes;
        }
        Ok(result)
    }

    fn compact_segment(&self, id: u16) -> Result<CompactionResult> {
        let mut result = CompactionResult::default();

        let mut reader = {
            let mut state = self.state.write();
            let Some(segment) = state.datalog.segment_mut(id) else {
                return Ok(result);
            };
            // No appends past this point; the file contents are now stable
            // and can be read without the lock.
            segment.meta.full = true;
            state.datalog.segment(id).expect("segment exists").reader()?
        };

        loop {
            let mut state = self.state.write();
            match reader.next()? {
                Some(record) => match record.kind {
                    RecordKind::Delete => {
                        result.reclaimed_records += 1;
                        result.reclaimed_bytes += record.data.len() as u64;
                    }
                    RecordKind::Put => {
                        let moved = move_record(&mut state, self.hash(record.key()), &record)?;
                        if !moved {
                            result.reclaimed_records += 1;
                            result.reclaimed_bytes += record.data.len() as u64;
                        }
                    }
                },
                None => break,
            }
        }

        let mut state = self.state.write();
        state.datalog.remove_segment(id)?;
        Ok(result)
    }
}

/// Segments worth compacting, ascending by sequence id.
///
/// The scan runs newest to oldest and skips segments below the size or
/// fragmentation thresholds.  Once a picked segment carries delete records
/// every older segment joins the selection: a tombstone may only be dropped
/// when no older segment can still hold a live put for its key.
fn pick_for_compaction(state: &State, min_segment_size: u32, min_fragmentation: f32) -> Vec<u16> {
    let ordered = state.datalog.segments_by_sequence_id();
    let mut picked: Vec<u16> = Vec::new();
    for i in (0..ordered.len()).rev() {
        let segment = state.datalog.segment(ordered[i]).expect("listed segment exists");
        if segment.size() < min_segment_size as u64 {
            continue;
        }
        let fragmentation = segment.meta.deleted_bytes as f32 / segment.size() as f32;
        if fragmentation < min_fragmentation {
            continue;
        }
        picked.insert(0, ordered[i]);
        if segment.meta.delete_records > 0 {
            picked = ordered[..i].iter().copied().chain(picked).collect();
            break;
        }
    }
    picked
}

/// Re-home one live record into the active segment.
///
/// `(hash, segment_id, offset)` uniquely identifies the live version of a
/// key: any later put would have re-pointed the slot elsewhere.  When no
/// slot matches the record is obsolete and the caller reclaims it.
fn move_record(state: &mut State, hash: u32, record: &Record) -> Result<bool> {
    let mut live = false;
    state.index.get(hash, |sl| {
        live = sl.segment_id == record.segment_id && sl.offset == record.offset;
        Ok(live)
    })?;
    if !live {
        return Ok(false);
    }

    let (segment_id, offset) = state.datalog.write_record(&record.data, RecordKind::Put)?;
    let new_slot = Slot {
        hash,
        segment_id,
        key_size: record.key().len() as u16,
        value_size: record.value().len() as u32,
        offset,
    };
    let rewritten = state.index.rewrite_slot(
        hash,
        |sl| sl.segment_id == record.segment_id && sl.offset == record.offset,
        new_slot,
    )?;
    debug_assert!(rewritten, "slot vanished under the write lock");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::segment::SegmentMeta;

    fn open_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default()
            .max_segment_size(1024)
            .compaction_min_segment_size(520)
            .compaction_min_fragmentation(0.02);
        let db = Db::open(dir.path(), opts).unwrap();
        (dir, db)
    }

    fn segment_count(db: &Db) -> usize {
        db.shared.state.read().datalog.segment_count()
    }

    fn segment_meta(db: &Db, id: u16) -> Option<SegmentMeta> {
        db.shared
            .state
            .read()
            .datalog
            .segment(id)
            .map(|segment| segment.meta.clone())
    }

    // A 1024-byte segment fits 42 twelve-byte records after its header.
    const MAX_ITEMS_PER_SEGMENT: u8 = 42;

    #[test]
    fn empty_db_compacts_to_nothing() {
        let (_dir, db) = open_db();
        assert_eq!(segment_count(&db), 1);
        let result = db.compact().unwrap();
        assert_eq!(result, CompactionResult::default());
        assert_eq!(segment_count(&db), 1);
    }

    #[test]
    fn compacts_the_only_segment() {
        let (_dir, db) = open_db();
        for _ in 0..10 {
            db.put(&[0], &[0]).unwrap();
        }
        assert_eq!(segment_count(&db), 1);
        assert_eq!(
            segment_meta(&db, 0).unwrap(),
            SegmentMeta {
                full: false,
                put_records: 10,
                delete_records: 0,
                deleted_keys: 9,
                deleted_bytes: 108,
            }
        );
        let result = db.compact().unwrap();
        assert_eq!(
            result,
            CompactionResult {
                compacted_segments: 1,
                reclaimed_records: 9,
                reclaimed_bytes: 108,
            }
        );
        assert_eq!(segment_count(&db), 1);
        assert!(segment_meta(&db, 0).is_none());
        assert_eq!(
            segment_meta(&db, 1).unwrap(),
            SegmentMeta {
                put_records: 1,
                ..SegmentMeta::default()
            }
        );
        assert_eq!(db.get(&[0]).unwrap(), Some(vec![0]));
    }

    #[test]
    fn compacts_partially_obsolete_segment() {
        let (_dir, db) = open_db();
        for i in 0..MAX_ITEMS_PER_SEGMENT {
            db.put(&[i], &[i]).unwrap();
        }
        for i in 0..40 {
            db.put(&[i], &[i]).unwrap();
        }
        assert_eq!(segment_count(&db), 2);
        assert_eq!(
            segment_meta(&db, 0).unwrap(),
            SegmentMeta {
                full: true,
                put_records: 42,
                delete_records: 0,
                deleted_keys: 40,
                deleted_bytes: 480,
            }
        );
        let result = db.compact().unwrap();
        assert_eq!(
            result,
            CompactionResult {
                compacted_segments: 1,
                reclaimed_records: 40,
                reclaimed_bytes: 480,
            }
        );
        assert_eq!(segment_count(&db), 1);
        // All 42 keys still return their latest values.
        for i in 0..MAX_ITEMS_PER_SEGMENT {
            assert_eq!(db.get(&[i]).unwrap(), Some(vec![i]), "key {}", i);
        }
        assert_eq!(db.count(), 42);
    }

    #[test]
    fn compacts_fully_overwritten_segments() {
        let (_dir, db) = open_db();
        for _ in 0..4 {
            for i in 0..MAX_ITEMS_PER_SEGMENT {
                db.put(&[i], &[i]).unwrap();
            }
        }
        assert_eq!(segment_count(&db), 4);
        let result = db.compact().unwrap();
        assert_eq!(
            result,
            CompactionResult {
                compacted_segments: 3,
                reclaimed_records: 126,
                reclaimed_bytes: 1512,
            }
        );
        assert_eq!(segment_count(&db), 1);
        assert_eq!(db.count(), 42);
    }

    #[test]
    fn skips_unfragmented_segments() {
        let (_dir, db) = open_db();
        for i in 0..MAX_ITEMS_PER_SEGMENT {
            db.put(&[i], &[i]).unwrap();
        }
        let result = db.compact().unwrap();
        assert_eq!(result, CompactionResult::default());
        assert_eq!(segment_count(&db), 1);
    }

    #[test]
    fn skips_below_fragmentation_threshold() {
        let (_dir, db) = open_db();
        for i in 0..MAX_ITEMS_PER_SEGMENT {
            db.put(&[i], &[i]).unwrap();
        }
        db.put(&[0], &[0]).unwrap();
        assert_eq!(segment_count(&db), 2);
        // 12 of 1016 bytes deleted: ~0.012, under the 0.02 threshold.
        let result = db.compact().unwrap();
        assert_eq!(result, CompactionResult::default());
        assert_eq!(segment_count(&db), 2);

        // One more overwrite crosses it.
        db.put(&[1], &[1]).unwrap();
        let result = db.compact().unwrap();
        assert_eq!(
            result,
            CompactionResult {
                compacted_segments: 1,
                reclaimed_records: 2,
                reclaimed_bytes: 24,
            }
        );
        assert_eq!(segment_count(&db), 1);
    }

    #[test]
    fn delete_records_extend_selection_to_older_segments() {
        let (_dir, db) = open_db();
        for i in 0..(MAX_ITEMS_PER_SEGMENT * 2 - 1) {
            db.put(&[i], &[i]).unwrap();
        }
        db.delete(&[MAX_ITEMS_PER_SEGMENT]).unwrap();
        db.put(&[MAX_ITEMS_PER_SEGMENT], &[0]).unwrap();
        db.put(&[MAX_ITEMS_PER_SEGMENT + 1], &[0]).unwrap();

        assert_eq!(segment_count(&db), 3);
        assert_eq!(
            segment_meta(&db, 1).unwrap(),
            SegmentMeta {
                full: true,
                put_records: 41,
                delete_records: 1,
                deleted_keys: 2,
                deleted_bytes: 35,
            }
        );

        let result = db.compact().unwrap();
        assert_eq!(
            result,
            CompactionResult {
                compacted_segments: 2,
                reclaimed_records: 3,
                reclaimed_bytes: 35,
            }
        );
        assert_eq!(segment_count(&db), 2);
        for i in 0..(MAX_ITEMS_PER_SEGMENT * 2 - 1) {
            let expected = if i == MAX_ITEMS_PER_SEGMENT || i == MAX_ITEMS_PER_SEGMENT + 1 {
                vec![0]
            } else {
                vec![i]
            };
            assert_eq!(db.get(&[i]).unwrap(), Some(expected), "key {}", i);
        }
    }

    #[test]
    fn deleting_everything_compacts_to_zero_segments() {
        let (_dir, db) = open_db();
        for i in 0..MAX_ITEMS_PER_SEGMENT {
            db.put(&[i], &[i]).unwrap();
        }
        for i in 0..MAX_ITEMS_PER_SEGMENT {
            db.delete(&[i]).unwrap();
        }
        assert_eq!(segment_count(&db), 2);
        assert_eq!(
            segment_meta(&db, 0).unwrap(),
            SegmentMeta {
                full: true,
                put_records: 42,
                delete_records: 0,
                deleted_keys: 42,
                deleted_bytes: 504,
            }
        );
        assert_eq!(
            segment_meta(&db, 1).unwrap(),
            SegmentMeta {
                full: false,
                put_records: 0,
                delete_records: 42,
                deleted_keys: 0,
                deleted_bytes: 462,
            }
        );
        let result = db.compact().unwrap();
        assert_eq!(
            result,
            CompactionResult {
                compacted_segments: 2,
                reclaimed_records: 84,
                reclaimed_bytes: 966,
            }
        );
        assert_eq!(segment_count(&db), 0);
        assert_eq!(db.count(), 0);

        // Writes still work: a fresh segment is allocated on demand.
        db.put(b"k", b"v").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn compaction_preserves_observable_state() {
        let (_dir, db) = open_db();
        for round in 0..3u8 {
            for i in 0..60u8 {
                db.put(&[i], &[i, round]).unwrap();
            }
        }
        for i in 40..50u8 {
            db.delete(&[i]).unwrap();
        }
        let mut before: Vec<(Vec<u8>, Vec<u8>)> =
            db.items().collect::<Result<Vec<_>>>().unwrap();
        before.sort();
        let record_bytes = |db: &Db| -> u64 {
            let state = db.shared.state.read();
            state
                .datalog
                .segments_by_sequence_id()
                .iter()
                .map(|&id| state.datalog.segment(id).unwrap().size() - 512)
                .sum()
        };
        let bytes_before = record_bytes(&db);

        let result = db.compact().unwrap();

        let mut after: Vec<(Vec<u8>, Vec<u8>)> =
            db.items().collect::<Result<Vec<_>>>().unwrap();
        after.sort();
        assert_eq!(before, after);
        assert_eq!(db.count(), 50);
        // Reclaimed plus remaining accounts for every record byte.
        assert_eq!(bytes_before - result.reclaimed_bytes, record_bytes(&db));
    }

    #[test]
    fn concurrent_compactions_are_mutually_exclusive() {
        let (_dir, db) = open_db();
        for _ in 0..2 {
            for i in 0..MAX_ITEMS_PER_SEGMENT {
                db.put(&[i], &[i]).unwrap();
            }
        }

        let guard = db.shared.state.write();
        std::thread::scope(|scope| {
            let handle = scope.spawn(|| db.compact());
            // Wait for the first compaction to claim the flag; it then
            // blocks on the state lock we hold.
            while !db.shared.compaction_running.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            assert!(matches!(db.compact(), Err(Error::Busy)));
            drop(guard);
            let result = handle.join().unwrap().unwrap();
            assert_eq!(result.compacted_segments, 1);
        });
    }
}
