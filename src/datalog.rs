//! The datalog: the set of append-only segments and the write routing
//! between them.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::file::HEADER_SIZE;
use crate::files;
use crate::index::Slot;
use crate::record::{self, RecordKind};
use crate::segment::Segment;

/// Capacity of the segment table; segment ids are 0 ..= 32766.
pub(crate) const MAX_SEGMENTS: usize = i16::MAX as usize;

/// Owns every segment and routes writes to the currently writable one.
#[derive(Debug)]
pub(crate) struct Datalog {
    dir: PathBuf,
    max_segment_size: u32,
    /// Dense table indexed by segment id.
    segments: Vec<Option<Box<Segment>>>,
    /// Id of the currently writable segment, if any.
    current: Option<u16>,
    /// Highest sequence id ever observed; the next segment gets `+ 1`.
    max_sequence_id: u64,
}

impl Datalog {
    /// Open every segment in `dir` and install a writable segment.
    ///
    /// With `rebuild_meta` unset (the recovery path) missing sidecars are
    /// left zeroed for the replay to fill in.
    pub fn open(dir: &Path, max_segment_size: u32, rebuild_meta: bool) -> Result<Self> {
        let mut datalog = Self {
            dir: dir.to_path_buf(),
            max_segment_size,
            segments: (0..MAX_SEGMENTS).map(|_| None).collect(),
            current: None,
            max_sequence_id: 0,
        };

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((id, sequence_id)) = files::parse_segment_name(name) else {
                continue;
            };
            if datalog.segments[id as usize].is_some() {
                return Err(Error::Corrupted(format!("duplicate segment id {}", id)));
            }
            let segment = Segment::open(dir, id, sequence_id, rebuild_meta)?;
            datalog.max_sequence_id = datalog.max_sequence_id.max(sequence_id);
            datalog.segments[id as usize] = Some(Box::new(segment));
        }

        datalog.swap_segment()?;
        Ok(datalog)
    }

    /// Reference to a segment by id.
    pub fn segment(&self, id: u16) -> Option<&Segment> {
        self.segments[id as usize].as_deref()
    }

    /// Mutable reference to a segment by id.
    pub fn segment_mut(&mut self, id: u16) -> Option<&mut Segment> {
        self.segments[id as usize].as_deref_mut()
    }

    /// Number of open segments.
    pub fn segment_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_some()).count()
    }

    /// Segment ids in ascending sequence order: the replay and compaction
    /// order, stable across segment-id reuse.
    pub fn segments_by_sequence_id(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .segments
            .iter()
            .flatten()
            .map(|segment| segment.id)
            .collect();
        ids.sort_by_key(|&id| self.segments[id as usize].as_ref().map(|s| s.sequence_id));
        ids
    }

    /// Install a writable segment: reuse the newest segment when it is not
    /// full, otherwise create a new one on the lowest free id.
    pub fn swap_segment(&mut self) -> Result<()> {
        // Only the newest segment may take appends; writing into an older id
        // would break the sequence-ordered replay.
        let newest = self
            .segments
            .iter()
            .flatten()
            .max_by_key(|segment| segment.sequence_id);
        if let Some(segment) = newest {
            if !segment.meta.full {
                self.current = Some(segment.id);
                return Ok(());
            }
        }

        let free_id = self
            .segments
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(Error::SegmentsExhausted)?;
        let sequence_id = self.max_sequence_id + 1;
        let segment = Segment::open(&self.dir, free_id as u16, sequence_id, true)?;
        self.max_sequence_id = sequence_id;
        self.segments[free_id] = Some(Box::new(segment));
        self.current = Some(free_id as u16);
        Ok(())
    }

    fn writable_segment(&mut self, len: usize) -> Result<&mut Segment> {
        let needs_swap = match self.current.and_then(|id| self.segment(id)) {
            Some(segment) => {
                segment.meta.full || segment.size() + len as u64 > self.max_segment_size as u64
            }
            None => true,
        };
        if needs_swap {
            if let Some(segment) = self.current.and_then(|id| self.segment_mut(id)) {
                segment.meta.full = true;
            }
            self.swap_segment()?;
        }
        let id = self.current.expect("swap_segment installed a segment");
        Ok(self.segments[id as usize]
            .as_deref_mut()
            .expect("current segment exists"))
    }

    /// Append an encoded record, returning its `(segment_id, offset)`
    /// locator.  Rolls over to a fresh segment when the current one cannot
    /// fit `data`.
    pub fn write_record(&mut self, data: &[u8], kind: RecordKind) -> Result<(u16, u32)> {
        let segment = self.writable_segment(data.len())?;
        let offset = segment.append(data)?;
        match kind {
            RecordKind::Put => segment.meta.put_records += 1,
            RecordKind::Delete => segment.meta.delete_records += 1,
        }
        Ok((segment.id, offset))
    }

    /// Record that the record behind `slot` has been shadowed by a newer put
    /// or delete.
    pub fn track_overwrite(&mut self, slot: &Slot) {
        if let Some(segment) = self.segment_mut(slot.segment_id) {
            segment.meta.deleted_keys += 1;
            segment.meta.deleted_bytes += record::encoded_size(slot.kv_size());
        }
    }

    /// Emit a tombstone for `key`, whose live record is behind `slot`.
    ///
    /// The tombstone's own bytes are counted as deleted right away: it only
    /// exists for replay and is dead weight once compaction has proven no
    /// older segment still holds a put for the key.
    pub fn del(&mut self, key: &[u8], slot: &Slot) -> Result<()> {
        self.track_overwrite(slot);
        let data = record::encode_delete(key);
        let len = data.len() as u32;
        self.write_record(&data, RecordKind::Delete)?;
        let id = self.current.expect("write_record installed a segment");
        if let Some(segment) = self.segment_mut(id) {
            segment.meta.deleted_bytes += len;
        }
        Ok(())
    }

    /// Borrow the key and value bytes behind `slot` from the segment's map.
    pub fn read_key_value(&self, slot: &Slot) -> Result<(&[u8], &[u8])> {
        let segment = self
            .segment(slot.segment_id)
            .ok_or_else(|| Error::Corrupted(format!("no segment {}", slot.segment_id)))?;
        let kv = segment.file.slice(
            slot.offset as u64 + record::RECORD_HEADER_SIZE as u64,
            slot.kv_size() as u64,
        )?;
        Ok(kv.split_at(slot.key_size as usize))
    }

    /// Borrow just the key bytes behind `slot`.
    pub fn read_key(&self, slot: &Slot) -> Result<&[u8]> {
        let segment = self
            .segment(slot.segment_id)
            .ok_or_else(|| Error::Corrupted(format!("no segment {}", slot.segment_id)))?;
        segment.file.slice(
            slot.offset as u64 + record::RECORD_HEADER_SIZE as u64,
            slot.key_size as u64,
        )
    }

    /// Close `id`: delete its data file and meta sidecar and clear the slot.
    pub fn remove_segment(&mut self, id: u16) -> Result<()> {
        if let Some(segment) = self.segments[id as usize].take() {
            let data_path = segment.file.path().to_path_buf();
            let meta_path = segment.meta_path(&self.dir);
            drop(segment);
            std::fs::remove_file(&data_path)?;
            match std::fs::remove_file(&meta_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if self.current == Some(id) {
            self.current = None;
        }
        Ok(())
    }

    /// Flush the writable segment to stable storage.
    pub fn sync(&self) -> Result<()> {
        if let Some(segment) = self.current.and_then(|id| self.segment(id)) {
            segment.file.sync()?;
        }
        Ok(())
    }

    /// Write every segment's meta sidecar.  Called on clean close.
    pub fn write_meta(&self) -> Result<()> {
        for segment in self.segments.iter().flatten() {
            segment.write_meta(&self.dir)?;
        }
        Ok(())
    }

    /// Largest record payload a fresh segment can hold.
    pub fn max_record_size(&self) -> u64 {
        (self.max_segment_size as u64).saturating_sub(HEADER_SIZE)
    }
}
