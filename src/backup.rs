//! Hot backup of an open database.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::db::Db;
use crate::error::Result;
use crate::files;

impl Db {
    /// Copy the database into the directory at `path` while it stays open
    /// for reads and writes.
    ///
    /// Only segment files are copied: full segments whole, the active ones
    /// bounded to their size at the start of the backup (segments are
    /// append-only, so that prefix is stable).  A `lock` file is placed in
    /// the destination, so opening the backup runs the normal recovery path
    /// and rebuilds the index, exactly as if the source had crashed right
    /// before a clean shutdown.  Backups serialize with compaction through
    /// the maintenance mutex; segment files cannot disappear mid-copy.
    pub fn backup<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let _maintenance = self.shared.maintenance.lock();
        std::fs::create_dir_all(path)?;

        let segments: Vec<(String, Option<u64>)> = {
            let state = self.shared.state.read();
            state
                .datalog
                .segments_by_sequence_id()
                .iter()
                .map(|&id| {
                    let segment = state.datalog.segment(id).expect("listed segment exists");
                    let name = files::segment_name(segment.id, segment.sequence_id);
                    let bound = (!segment.meta.full).then(|| segment.size());
                    (name, bound)
                })
                .collect()
        };

        for (name, bound) in segments {
            let mut src = File::open(files::db_path(&self.shared.path, &name))?;
            let mut dst = File::create(path.join(&name))?;
            match bound {
                Some(limit) => {
                    std::io::copy(&mut src.by_ref().take(limit), &mut dst)?;
                }
                None => {
                    std::io::copy(&mut src, &mut dst)?;
                }
            }
            dst.sync_all()?;
        }

        File::create(path.join(files::LOCK_NAME))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Db;
    use crate::error::Result;
    use crate::options::Options;
    use std::collections::BTreeMap;

    #[test]
    fn backup_holds_the_full_key_set() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let dst = dst_dir.path().join("backup");

        let db = Db::open(src_dir.path(), Options::default()).unwrap();
        let mut expected = BTreeMap::new();
        for i in 0..100u8 {
            db.put(&[i], &[i]).unwrap();
            expected.insert(vec![i], vec![i]);
        }
        db.backup(&dst).unwrap();

        // The source stays usable and untouched.
        assert_eq!(db.count(), 100);
        db.close().unwrap();

        let backup = Db::open(&dst, Options::default()).unwrap();
        let got: BTreeMap<Vec<u8>, Vec<u8>> = backup
            .items()
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(got, expected);
        backup.close().unwrap();
    }

    #[test]
    fn backup_excludes_writes_after_the_snapshot_starts() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst = src_dir.path().join("backup");

        let db = Db::open(src_dir.path().join("db"), Options::default()).unwrap();
        for i in 0..50u8 {
            db.put(&[i], &[i]).unwrap();
        }
        db.backup(&dst).unwrap();
        // Writes after the backup belong only to the source.
        for i in 50..60u8 {
            db.put(&[i], &[i]).unwrap();
        }
        assert_eq!(db.count(), 60);
        db.close().unwrap();

        let backup = Db::open(&dst, Options::default()).unwrap();
        assert_eq!(backup.count(), 50);
        assert!(!backup.has(&[55]).unwrap());
        backup.close().unwrap();
    }

    #[test]
    fn backup_of_multi_segment_db() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst = src_dir.path().join("backup");

        let db = Db::open(
            src_dir.path().join("db"),
            Options::default().max_segment_size(1024),
        )
        .unwrap();
        for i in 0..120u8 {
            db.put(&[i], &[i]).unwrap();
        }
        for i in 0..20u8 {
            db.delete(&[i]).unwrap();
        }
        db.backup(&dst).unwrap();
        db.close().unwrap();

        let backup = Db::open(&dst, Options::default().max_segment_size(1024)).unwrap();
        assert_eq!(backup.count(), 100);
        assert_eq!(backup.get(&[5]).unwrap(), None);
        assert_eq!(backup.get(&[100]).unwrap(), Some(vec![100]));
        backup.close().unwrap();
    }
}
