//! Append-oriented file wrapper with a memory-mapped read view.
//!
//! Every on-disk file of the database starts with a fixed 512-byte header so
//! that byte offset 0 never addresses real content; an offset of 0 therefore
//! doubles as the "empty" sentinel in index slots and overflow links.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{Error, Result};

/// Size of the fixed file header, which is also the alignment unit of index
/// buckets.
pub(crate) const HEADER_SIZE: u64 = 512;

/// Magic bytes at the start of every database file.
const MAGIC: [u8; 4] = *b"bdbF";
/// On-disk format version.
const FORMAT_VERSION: u16 = 2;

pub(crate) fn encode_header() -> [u8; HEADER_SIZE as usize] {
    let mut buf = [0u8; HEADER_SIZE as usize];
    buf[..4].copy_from_slice(&MAGIC);
    buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf
}

pub(crate) fn check_header(buf: &[u8]) -> Result<()> {
    if buf[..4] != MAGIC {
        return Err(Error::Corrupted("bad file magic".to_string()));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != FORMAT_VERSION {
        return Err(Error::Corrupted(format!(
            "unsupported format version {}",
            version
        )));
    }
    Ok(())
}

/// A database file: appends go through the file descriptor, random reads go
/// through a mmap view that is refreshed whenever the file grows or shrinks.
#[derive(Debug)]
pub(crate) struct MmapFile {
    file: File,
    mmap: Option<Mmap>,
    size: u64,
    path: PathBuf,
}

impl MmapFile {
    /// Open or create the file at `path`, writing the header into a fresh
    /// file and validating it in an existing one.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let size = file.metadata()?.len();
        let mut f = Self {
            file,
            mmap: None,
            size,
            path: path.to_path_buf(),
        };
        if size == 0 {
            f.append(&encode_header())?;
        } else {
            f.read_header()?;
            f.remap()?;
        }
        Ok(f)
    }

    fn read_header(&mut self) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf).map_err(|_| {
            Error::Corrupted(format!("truncated header in {}", self.path.display()))
        })?;
        check_header(&buf)
    }

    fn remap(&mut self) -> Result<()> {
        self.mmap = if self.size == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&self.file)? })
        };
        Ok(())
    }

    /// Current file size in bytes, header included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True when the file holds nothing beyond its header.
    pub fn empty(&self) -> bool {
        self.size == HEADER_SIZE
    }

    /// Path this file was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `data` and return the offset it was written at.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let off = self.size;
        self.file.seek(SeekFrom::Start(off))?;
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        self.remap()?;
        Ok(off)
    }

    /// Grow the file by `len` zero bytes and return the offset of the new
    /// region.  Used to allocate index buckets.
    pub fn extend(&mut self, len: u32) -> Result<u64> {
        let off = self.size;
        self.size += len as u64;
        self.file.set_len(self.size)?;
        self.remap()?;
        Ok(off)
    }

    /// Overwrite `data.len()` bytes at `off`.  The region must already exist.
    pub fn write_at(&mut self, off: u64, data: &[u8]) -> Result<()> {
        debug_assert!(off + data.len() as u64 <= self.size);
        self.file.seek(SeekFrom::Start(off))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Borrow `len` bytes at `off` from the mmap view.  The slice is valid
    /// until the next append/extend/truncate; callers copy out anything they
    /// keep.
    pub fn slice(&self, off: u64, len: u64) -> Result<&[u8]> {
        let end = off + len;
        if end > self.size {
            return Err(Error::Corrupted(format!(
                "read of {}..{} beyond end {} of {}",
                off,
                end,
                self.size,
                self.path.display()
            )));
        }
        let mmap = self
            .mmap
            .as_ref()
            .ok_or_else(|| Error::Corrupted(format!("empty file {}", self.path.display())))?;
        Ok(&mmap[off as usize..end as usize])
    }

    /// Shrink the file to `size` bytes.  The mapping is dropped first so the
    /// truncation works on platforms that refuse to shrink a mapped file.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.mmap = None;
        self.file.set_len(size)?;
        self.size = size;
        self.remap()?;
        Ok(())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Clone the underlying descriptor for an independent sequential reader.
    pub fn try_clone(&self) -> Result<File> {
        Ok(self.file.try_clone()?)
    }
}
