//! Crash recovery: rebuild the index from the datalog.
//!
//! Recovery runs when `open` finds the lock file already present, meaning
//! the previous process never reached its clean-close path.  The index and
//! every meta file are quarantined (they may be arbitrarily stale relative
//! to the log) and the segments are replayed in sequence order; whatever the
//! log proves is the state.

use std::path::Path;

use crate::db::State;
use crate::error::{Error, Result};
use crate::files;
use crate::hash;
use crate::index::Slot;
use crate::record::RecordKind;

/// Rename every non-segment, non-lock file to a `.bac` backup so the replay
/// starts from a blank index.  Quarantining instead of deleting keeps the old
/// state around while recovery is still fallible.
pub(crate) fn quarantine_nonsegment_files(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || files::is_segment_file(&path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == files::LOCK_NAME || name.ends_with(&format!(".{}", files::BACKUP_EXT)) {
            continue;
        }
        let backup = path.with_file_name(format!("{}.{}", name, files::BACKUP_EXT));
        log::debug!("quarantining {} to {}", path.display(), backup.display());
        std::fs::rename(&path, &backup)?;
    }
    Ok(())
}

/// Delete the `.bac` files once the replay has succeeded.
fn remove_backup_files(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == files::BACKUP_EXT) {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Replay every segment in ascending sequence order, rebuilding the index
/// and the segment counters, truncating torn tails as they are found.
pub(crate) fn recover(dir: &Path, state: &mut State, hash_seed: u32) -> Result<()> {
    log::info!("recovering database at {}", dir.display());

    for id in state.datalog.segments_by_sequence_id() {
        replay_segment(state, id, hash_seed)?;
    }

    // Appends may only go to the newest segment; anything older is sealed so
    // replay order stays monotonic in sequence id.
    let ordered = state.datalog.segments_by_sequence_id();
    if let Some((_, older)) = ordered.split_last() {
        for &id in older {
            if let Some(segment) = state.datalog.segment_mut(id) {
                segment.meta.full = true;
            }
        }
    }

    remove_backup_files(dir)?;
    log::info!("recovery complete: {} keys", state.index.count());
    Ok(())
}

fn replay_segment(state: &mut State, id: u16, hash_seed: u32) -> Result<()> {
    let mut reader = state
        .datalog
        .segment(id)
        .expect("listed segment exists")
        .reader()?;

    loop {
        let record = match reader.next() {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(Error::Corrupted(reason)) => {
                // The tail beyond the last valid record is unrecoverable;
                // cut it off and move on to the next segment.
                let valid_end = reader.offset() as u64;
                log::warn!(
                    "truncating segment {} to {} bytes: {}",
                    id,
                    valid_end,
                    reason
                );
                let segment = state.datalog.segment_mut(id).expect("segment exists");
                segment.file.truncate(valid_end)?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let h = hash::sum32_with_seed(record.key(), hash_seed);
        match record.kind {
            RecordKind::Put => {
                let sl = Slot {
                    hash: h,
                    segment_id: id,
                    key_size: record.key().len() as u16,
                    value_size: record.value().len() as u32,
                    offset: record.offset,
                };
                state.put_slot(sl, record.key())?;
                let segment = state.datalog.segment_mut(id).expect("segment exists");
                segment.meta.put_records += 1;
            }
            RecordKind::Delete => {
                let State { index, datalog } = state;
                index.delete(h, |sl| {
                    if sl.key_size as usize != record.key().len() {
                        return Ok(false);
                    }
                    if datalog.read_key(sl)? != record.key() {
                        return Ok(false);
                    }
                    datalog.track_overwrite(sl);
                    Ok(true)
                })?;
                let segment = state.datalog.segment_mut(id).expect("segment exists");
                segment.meta.delete_records += 1;
                segment.meta.deleted_bytes += record.data.len() as u32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Db;
    use crate::error::Result;
    use crate::options::Options;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::Path;

    /// Simulate a crash after a clean shutdown's data reached disk: recreate
    /// the lock file (as if never released) and drop the index state.
    fn simulate_crash(dir: &Path) {
        std::fs::write(dir.join("lock"), b"").unwrap();
        for name in ["index.meta", "main.pix", "overflow.pix", "db.meta"] {
            let _ = std::fs::remove_file(dir.join(name));
        }
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().map_or(false, |ext| ext == "meta") {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    fn active_segment_path(dir: &Path) -> std::path::PathBuf {
        let mut segments: Vec<(u64, std::path::PathBuf)> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| {
                let path = entry.unwrap().path();
                let name = path.file_name()?.to_str()?.to_string();
                let (_, seq) = crate::files::parse_segment_name(&name)?;
                Some((seq, path))
            })
            .collect();
        segments.sort();
        segments.pop().unwrap().1
    }

    #[test]
    fn delete_then_recover() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Db::open(dir.path(), Options::default()).unwrap();
            db.put(&[1], &[1]).unwrap();
            db.put(&[2], &[2]).unwrap();
            db.delete(&[1]).unwrap();
            db.close().unwrap();
        }
        simulate_crash(dir.path());

        let db = Db::open(dir.path(), Options::default()).unwrap();
        assert_eq!(db.count(), 1);
        assert_eq!(db.get(&[1]).unwrap(), None);
        assert_eq!(db.get(&[2]).unwrap(), Some(vec![2]));
        db.close().unwrap();
    }

    #[test]
    fn corrupted_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Db::open(dir.path(), Options::default()).unwrap();
            for i in 0..128u8 {
                db.put(&[i], &[i]).unwrap();
            }
            db.close().unwrap();
        }
        // A record frame with a checksum that cannot match.
        let garbage = [
            0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01, 0x28, 0x13, 0xc5, 0x00,
        ];
        let segment = active_segment_path(dir.path());
        let clean_len = std::fs::metadata(&segment).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(&garbage).unwrap();
        drop(file);
        simulate_crash(dir.path());

        let db = Db::open(dir.path(), Options::default()).unwrap();
        assert_eq!(db.count(), 128);
        for i in 0..128u8 {
            assert_eq!(db.get(&[i]).unwrap(), Some(vec![i]), "key {}", i);
        }
        db.close().unwrap();
        assert_eq!(std::fs::metadata(&segment).unwrap().len(), clean_len);
    }

    #[test]
    fn arbitrary_garbage_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Db::open(dir.path(), Options::default()).unwrap();
            for i in 0..32u8 {
                db.put(&[i], &[i, i]).unwrap();
            }
            db.close().unwrap();
        }
        let segment = active_segment_path(dir.path());
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(&[0xde; 7]).unwrap();
        drop(file);
        simulate_crash(dir.path());

        let db = Db::open(dir.path(), Options::default()).unwrap();
        assert_eq!(db.count(), 32);
        db.close().unwrap();
    }

    #[test]
    fn recovery_rebuilds_overwrite_accounting() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Db::open(dir.path(), Options::default()).unwrap();
            for i in 0..20u8 {
                db.put(&[i], &[i]).unwrap();
            }
            for i in 0..10u8 {
                db.put(&[i], &[i + 100]).unwrap();
            }
            db.delete(&[15]).unwrap();
            db.close().unwrap();
        }
        simulate_crash(dir.path());

        let db = Db::open(dir.path(), Options::default()).unwrap();
        assert_eq!(db.count(), 19);
        {
            let state = db.shared.state.read();
            let mut live = 0i64;
            for id in state.datalog.segments_by_sequence_id() {
                let meta = &state.datalog.segment(id).unwrap().meta;
                live += meta.put_records as i64 - meta.deleted_keys as i64;
            }
            assert_eq!(live, 19);
        }
        for i in 0..10u8 {
            assert_eq!(db.get(&[i]).unwrap(), Some(vec![i + 100]));
        }
        assert_eq!(db.get(&[15]).unwrap(), None);
        db.close().unwrap();
    }

    #[test]
    fn recovery_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Db::open(dir.path(), Options::default()).unwrap();
            for i in 0..10u8 {
                db.put(&[i], &[i]).unwrap();
            }
            db.close().unwrap();
        }
        for _ in 0..3 {
            simulate_crash(dir.path());
            let db = Db::open(dir.path(), Options::default()).unwrap();
            assert_eq!(db.count(), 10);
            db.close().unwrap();
        }
        let db = Db::open(dir.path(), Options::default()).unwrap();
        let items: Vec<_> = db.items().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(items.len(), 10);
        db.close().unwrap();
    }

    #[test]
    fn backup_files_are_removed_after_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Db::open(dir.path(), Options::default()).unwrap();
            db.put(b"k", b"v").unwrap();
            db.close().unwrap();
        }
        std::fs::write(dir.path().join("lock"), b"").unwrap();

        let db = Db::open(dir.path(), Options::default()).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        db.close().unwrap();

        let leftovers: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| {
                let name = entry.unwrap().file_name().to_str()?.to_string();
                name.ends_with(".bac").then_some(name)
            })
            .collect();
        assert!(leftovers.is_empty(), "stale backups: {:?}", leftovers);
    }

    #[test]
    fn recovery_with_multiple_segments_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default().max_segment_size(1024);
        {
            let db = Db::open(dir.path(), opts.clone()).unwrap();
            // Three generations of the same keys across several segments:
            // replay order decides which value wins.
            for round in 0..3u8 {
                for i in 0..50u8 {
                    db.put(&[i], &[round]).unwrap();
                }
            }
            db.close().unwrap();
        }
        simulate_crash(dir.path());

        let db = Db::open(dir.path(), opts).unwrap();
        assert_eq!(db.count(), 50);
        for i in 0..50u8 {
            assert_eq!(db.get(&[i]).unwrap(), Some(vec![2]), "key {}", i);
        }
        db.close().unwrap();
    }
}
