//! Names and locations of the files making up a database directory.

use std::path::{Path, PathBuf};

/// Lock file present while the database is open.
pub(crate) const LOCK_NAME: &str = "lock";
/// Database-wide meta file (hash seed).
pub(crate) const DB_META_NAME: &str = "db.meta";
/// Index-global meta file.
pub(crate) const INDEX_META_NAME: &str = "index.meta";
/// Main index bucket file.
pub(crate) const INDEX_MAIN_NAME: &str = "main.pix";
/// Index overflow bucket file.
pub(crate) const INDEX_OVERFLOW_NAME: &str = "overflow.pix";

/// Extension of segment data files.
pub(crate) const SEGMENT_EXT: &str = "psg";
/// Extension appended to quarantined files during recovery.
pub(crate) const BACKUP_EXT: &str = "bac";
/// Extension of meta files (db meta, index meta and segment sidecars).
pub(crate) const META_EXT: &str = "meta";

/// File name of a segment: zero-padded id, then creation sequence.
pub(crate) fn segment_name(id: u16, sequence_id: u64) -> String {
    format!("{:05}-{}.{}", id, sequence_id, SEGMENT_EXT)
}

/// File name of a segment's meta sidecar.
pub(crate) fn segment_meta_name(id: u16, sequence_id: u64) -> String {
    format!("{}.{}", segment_name(id, sequence_id), META_EXT)
}

/// Parse `(segment_id, sequence_id)` out of a segment file name.
/// Returns `None` for anything that is not a well-formed segment name.
pub(crate) fn parse_segment_name(name: &str) -> Option<(u16, u64)> {
    let stem = name.strip_suffix(&format!(".{}", SEGMENT_EXT))?;
    let (id, seq) = stem.split_once('-')?;
    if id.len() != 5 {
        return None;
    }
    let id: u16 = id.parse().ok()?;
    if id as usize >= crate::datalog::MAX_SEGMENTS {
        return None;
    }
    let seq: u64 = seq.parse().ok()?;
    Some((id, seq))
}

/// True if `path` names a segment data file.
pub(crate) fn is_segment_file(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == SEGMENT_EXT)
}

/// Full path of a named file inside the database directory.
pub(crate) fn db_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}
