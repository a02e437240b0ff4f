//! On-disk linear hashing hash table.
//!
//! The table lives in two files: `main.pix` holds buckets addressed by bucket
//! number, `overflow.pix` holds chain buckets addressed by absolute offset.
//! Growth happens one bucket at a time: when the load factor is exceeded the
//! bucket at the split pointer is rehashed into itself and a new bucket at
//! the end of the main file, so no bulk rehash ever blocks a writer.

mod bucket;

pub(crate) use bucket::{Bucket, Slot, BUCKET_SIZE, SLOTS_PER_BUCKET};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::file::{MmapFile, HEADER_SIZE};
use crate::files;

/// Target fill ratio; exceeding it after an insertion triggers a split.
const LOAD_FACTOR: f64 = 0.7;

/// Maximum number of live keys the index can hold.
pub(crate) const MAX_KEYS: u32 = u32::MAX;

/// Which of the two index files a bucket lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BucketFile {
    Main,
    Overflow,
}

/// A bucket together with its on-disk location.
#[derive(Clone, Debug)]
struct BucketHandle {
    file: BucketFile,
    offset: u64,
    bucket: Bucket,
}

/// Index-global state persisted in `index.meta` on clean close.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexMeta {
    level: u8,
    num_keys: u32,
    num_buckets: u32,
    split_bucket_idx: u32,
    free_overflow_offsets: Vec<u64>,
}

/// The on-disk linear hashing index.
#[derive(Debug)]
pub(crate) struct Index {
    dir: PathBuf,
    main: MmapFile,
    overflow: MmapFile,
    level: u8,
    num_keys: u32,
    num_buckets: u32,
    split_bucket_idx: u32,
    free_bucket_offs: Vec<u64>,
}

fn bucket_offset(idx: u32) -> u64 {
    HEADER_SIZE + BUCKET_SIZE as u64 * idx as u64
}

impl Index {
    /// Open the index files in `dir`.  A fresh main file is initialized with
    /// a single empty bucket; an existing one must come with its meta file.
    pub fn open(dir: &Path) -> Result<Self> {
        let main = MmapFile::open(&files::db_path(dir, files::INDEX_MAIN_NAME))?;
        let overflow = MmapFile::open(&files::db_path(dir, files::INDEX_OVERFLOW_NAME))?;
        let mut index = Self {
            dir: dir.to_path_buf(),
            main,
            overflow,
            level: 0,
            num_keys: 0,
            num_buckets: 1,
            split_bucket_idx: 0,
            free_bucket_offs: Vec::new(),
        };
        if index.main.empty() {
            index.main.extend(BUCKET_SIZE)?;
        } else {
            let meta: IndexMeta =
                crate::metafile::read_meta_file(&files::db_path(dir, files::INDEX_META_NAME))?;
            index.level = meta.level;
            index.num_keys = meta.num_keys;
            index.num_buckets = meta.num_buckets;
            index.split_bucket_idx = meta.split_bucket_idx;
            index.free_bucket_offs = meta.free_overflow_offsets;
        }
        Ok(index)
    }

    /// Number of live keys.
    pub fn count(&self) -> u32 {
        self.num_keys
    }

    /// Number of main buckets.
    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    /// Bucket number for `hash` under the current level and split pointer.
    fn bucket_index(&self, hash: u32) -> u32 {
        let bidx = (hash as u64 & ((1u64 << self.level) - 1)) as u32;
        if bidx < self.split_bucket_idx {
            (hash as u64 & ((1u64 << (self.level + 1)) - 1)) as u32
        } else {
            bidx
        }
    }

    fn read_bucket(&self, file: BucketFile, offset: u64) -> Result<BucketHandle> {
        let f = match file {
            BucketFile::Main => &self.main,
            BucketFile::Overflow => &self.overflow,
        };
        let bucket = Bucket::decode(f.slice(offset, BUCKET_SIZE as u64)?);
        Ok(BucketHandle {
            file,
            offset,
            bucket,
        })
    }

    fn write_bucket(&mut self, handle: &BucketHandle) -> Result<()> {
        let data = handle.bucket.encode();
        match handle.file {
            BucketFile::Main => self.main.write_at(handle.offset, &data),
            BucketFile::Overflow => self.overflow.write_at(handle.offset, &data),
        }
    }

    /// Call `visit` for every slot in the chain rooted at `hash`'s bucket
    /// whose hash matches, stopping when the visitor returns `true`.  The
    /// occupied prefix of each bucket ends at the first empty slot.
    pub fn get(
        &self,
        hash: u32,
        mut visit: impl FnMut(&Slot) -> Result<bool>,
    ) -> Result<()> {
        let mut file = BucketFile::Main;
        let mut offset = bucket_offset(self.bucket_index(hash));
        loop {
            let handle = self.read_bucket(file, offset)?;
            for slot in &handle.bucket.slots {
                if slot.is_empty() {
                    break;
                }
                if slot.hash == hash && visit(slot)? {
                    return Ok(());
                }
            }
            if handle.bucket.next == 0 {
                return Ok(());
            }
            file = BucketFile::Overflow;
            offset = handle.bucket.next;
        }
    }

    /// Insert `sl`, or overwrite the slot of the same key.
    ///
    /// `on_existing` is consulted for every occupied slot with a matching
    /// hash; returning `true` means "same key" and makes the new slot replace
    /// that one without growing `num_keys`.  A fresh insert lands in the
    /// first empty slot, allocating and linking an overflow bucket when the
    /// chain is out of space, and may trigger one split.
    pub fn put(
        &mut self,
        sl: Slot,
        mut on_existing: impl FnMut(&Slot) -> Result<bool>,
    ) -> Result<()> {
        let mut file = BucketFile::Main;
        let mut offset = bucket_offset(self.bucket_index(sl.hash));
        loop {
            let mut handle = self.read_bucket(file, offset)?;
            for i in 0..SLOTS_PER_BUCKET {
                let cur = handle.bucket.slots[i];
                if cur.is_empty() {
                    return self.install(handle, i, sl, true);
                }
                if cur.hash == sl.hash && on_existing(&cur)? {
                    return self.install(handle, i, sl, false);
                }
            }
            if handle.bucket.next == 0 {
                // Chain exhausted: link a fresh overflow bucket.
                let overflow_off = self.allocate_overflow_bucket()?;
                let mut next = BucketHandle {
                    file: BucketFile::Overflow,
                    offset: overflow_off,
                    bucket: Bucket::default(),
                };
                next.bucket.slots[0] = sl;
                if self.num_keys == MAX_KEYS {
                    return Err(Error::Full);
                }
                self.write_bucket(&next)?;
                handle.bucket.next = overflow_off;
                self.write_bucket(&handle)?;
                self.num_keys += 1;
                return self.maybe_split();
            }
            file = BucketFile::Overflow;
            offset = handle.bucket.next;
        }
    }

    fn install(
        &mut self,
        mut handle: BucketHandle,
        slot_idx: usize,
        sl: Slot,
        fresh: bool,
    ) -> Result<()> {
        if fresh && self.num_keys == MAX_KEYS {
            return Err(Error::Full);
        }
        handle.bucket.slots[slot_idx] = sl;
        self.write_bucket(&handle)?;
        if fresh {
            self.num_keys += 1;
            return self.maybe_split();
        }
        Ok(())
    }

    /// Remove the slot `on_match` identifies among the matching-hash slots.
    /// Returns whether a slot was removed.
    pub fn delete(
        &mut self,
        hash: u32,
        mut on_match: impl FnMut(&Slot) -> Result<bool>,
    ) -> Result<bool> {
        let mut file = BucketFile::Main;
        let mut offset = bucket_offset(self.bucket_index(hash));
        loop {
            let mut handle = self.read_bucket(file, offset)?;
            for i in 0..SLOTS_PER_BUCKET {
                let cur = handle.bucket.slots[i];
                if cur.is_empty() {
                    break;
                }
                if cur.hash == hash && on_match(&cur)? {
                    handle.bucket.remove(i);
                    self.write_bucket(&handle)?;
                    self.num_keys -= 1;
                    return Ok(true);
                }
            }
            if handle.bucket.next == 0 {
                return Ok(false);
            }
            file = BucketFile::Overflow;
            offset = handle.bucket.next;
        }
    }

    /// Occupied slots of the chain rooted at main bucket `bucket_idx`, used
    /// by the item iterator to batch one bucket's worth of keys.
    pub fn bucket_slots(&self, bucket_idx: u32) -> Result<Vec<Slot>> {
        let mut slots = Vec::new();
        let mut file = BucketFile::Main;
        let mut offset = bucket_offset(bucket_idx);
        loop {
            let handle = self.read_bucket(file, offset)?;
            for slot in &handle.bucket.slots {
                if slot.is_empty() {
                    break;
                }
                slots.push(*slot);
            }
            if handle.bucket.next == 0 {
                return Ok(slots);
            }
            file = BucketFile::Overflow;
            offset = handle.bucket.next;
        }
    }

    /// Rewrite the slot matching `predicate` in the chain for `hash`.
    /// Returns whether a slot was rewritten; used by compaction to re-home a
    /// moved record.
    pub fn rewrite_slot(
        &mut self,
        hash: u32,
        predicate: impl Fn(&Slot) -> bool,
        new_slot: Slot,
    ) -> Result<bool> {
        let mut file = BucketFile::Main;
        let mut offset = bucket_offset(self.bucket_index(hash));
        loop {
            let mut handle = self.read_bucket(file, offset)?;
            for i in 0..SLOTS_PER_BUCKET {
                let cur = handle.bucket.slots[i];
                if cur.is_empty() {
                    break;
                }
                if cur.hash == hash && predicate(&cur) {
                    handle.bucket.slots[i] = new_slot;
                    self.write_bucket(&handle)?;
                    return Ok(true);
                }
            }
            if handle.bucket.next == 0 {
                return Ok(false);
            }
            file = BucketFile::Overflow;
            offset = handle.bucket.next;
        }
    }

    fn allocate_overflow_bucket(&mut self) -> Result<u64> {
        if let Some(off) = self.free_bucket_offs.pop() {
            return Ok(off);
        }
        self.overflow.extend(BUCKET_SIZE)
    }

    fn maybe_split(&mut self) -> Result<()> {
        let capacity = self.num_buckets as u64 * SLOTS_PER_BUCKET as u64;
        if self.num_keys as f64 / capacity as f64 > LOAD_FACTOR {
            self.split()?;
        }
        Ok(())
    }

    /// Split the bucket at the split pointer into itself and a new bucket at
    /// the end of the main file, advancing the pointer (and the level once
    /// the pointer wraps).  Drained overflow buckets go to the free-list.
    fn split(&mut self) -> Result<()> {
        let updated_idx = self.split_bucket_idx;
        let new_bucket_off = self.main.extend(BUCKET_SIZE)?;

        self.split_bucket_idx += 1;
        if self.split_bucket_idx as u64 == 1u64 << self.level {
            self.level += 1;
            self.split_bucket_idx = 0;
        }

        // Snapshot the old chain before anything is rewritten.
        let mut slots = Vec::new();
        let mut drained = Vec::new();
        let mut file = BucketFile::Main;
        let mut offset = bucket_offset(updated_idx);
        loop {
            let handle = self.read_bucket(file, offset)?;
            for slot in &handle.bucket.slots {
                if slot.is_empty() {
                    break;
                }
                slots.push(*slot);
            }
            if handle.bucket.next == 0 {
                break;
            }
            drained.push(handle.bucket.next);
            file = BucketFile::Overflow;
            offset = handle.bucket.next;
        }

        let mut updated = SlotWriter::new(BucketFile::Main, bucket_offset(updated_idx));
        let mut created = SlotWriter::new(BucketFile::Main, new_bucket_off);
        for slot in slots {
            if self.bucket_index(slot.hash) == updated_idx {
                updated.insert(slot, self)?;
            } else {
                created.insert(slot, self)?;
            }
        }
        created.write(self)?;
        updated.write(self)?;

        // Only release the drained buckets once nothing reads them anymore,
        // or a reused offset could end up in two chains at once.
        self.free_bucket_offs.extend(drained);
        self.num_buckets += 1;
        Ok(())
    }

    /// Flush both index files to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.main.sync()?;
        self.overflow.sync()
    }

    /// Persist the index meta.  Called on clean close.
    pub fn write_meta(&self) -> Result<()> {
        let meta = IndexMeta {
            level: self.level,
            num_keys: self.num_keys,
            num_buckets: self.num_buckets,
            split_bucket_idx: self.split_bucket_idx,
            free_overflow_offsets: self.free_bucket_offs.clone(),
        };
        crate::metafile::write_meta_file(&files::db_path(&self.dir, files::INDEX_META_NAME), &meta)
    }
}

/// Appends slots to a bucket chain being rebuilt during a split, spilling
/// into freshly allocated overflow buckets as needed.
struct SlotWriter {
    current: BucketHandle,
    filled: Vec<BucketHandle>,
    slot_idx: usize,
}

impl SlotWriter {
    fn new(file: BucketFile, offset: u64) -> Self {
        Self {
            current: BucketHandle {
                file,
                offset,
                bucket: Bucket::default(),
            },
            filled: Vec::new(),
            slot_idx: 0,
        }
    }

    fn insert(&mut self, slot: Slot, index: &mut Index) -> Result<()> {
        if self.slot_idx == SLOTS_PER_BUCKET {
            let overflow_off = index.allocate_overflow_bucket()?;
            self.current.bucket.next = overflow_off;
            let prev = std::mem::replace(
                &mut self.current,
                BucketHandle {
                    file: BucketFile::Overflow,
                    offset: overflow_off,
                    bucket: Bucket::default(),
                },
            );
            self.filled.push(prev);
            self.slot_idx = 0;
        }
        self.current.bucket.slots[self.slot_idx] = slot;
        self.slot_idx += 1;
        Ok(())
    }

    fn write(self, index: &mut Index) -> Result<()> {
        for handle in &self.filled {
            index.write_bucket(handle)?;
        }
        index.write_bucket(&self.current)
    }
}
