//! Small serialized meta files (`db.meta`, `index.meta`, segment sidecars).
//!
//! Meta files carry the standard 512-byte header followed by a bincode
//! payload.  They are rewritten whole; partially written metas are caught by
//! the header check or by bincode and treated as corruption, which the caller
//! handles by rebuilding (segment sidecars) or by recovery.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::file::{check_header, encode_header, HEADER_SIZE};

/// Serialize `value` into the meta file at `path`, replacing any previous
/// contents.
pub(crate) fn write_meta_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&encode_header())?;
    bincode::serialize_into(&mut file, value)?;
    file.sync_all()?;
    Ok(())
}

/// Read a meta file written by [`write_meta_file`].
pub(crate) fn read_meta_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut file = OpenOptions::new().read(true).open(path)?;
    let mut header = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut header)
        .map_err(|_| Error::Corrupted(format!("truncated meta file {}", path.display())))?;
    check_header(&header)?;
    Ok(bincode::deserialize_from(&mut file)?)
}
