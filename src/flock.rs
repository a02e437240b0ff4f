//! Directory-scoped exclusive lock file.
//!
//! The lock file plays a double role: an OS-level advisory lock keeps a
//! second process out, and its mere presence at open time tells us the last
//! run did not shut down cleanly (the file is removed on clean close).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// An acquired lock on a database directory.
///
/// The OS lock is released when the handle is dropped; `unlock` additionally
/// removes the file, marking a clean shutdown.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock at `path`.
    ///
    /// Returns the lock and whether the lock file already existed, which is
    /// the signal that recovery is needed.  Fails with [`Error::Locked`] when
    /// another process holds the lock.
    pub fn acquire(path: &Path) -> Result<(Self, bool)> {
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Self::try_lock(&file)?;
        // Record the owning pid for debugging; contents are otherwise unused.
        let _ = writeln!(file, "{}", std::process::id());
        let _ = file.flush();
        Ok((
            Self {
                file,
                path: path.to_path_buf(),
            },
            existed,
        ))
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(Error::Locked);
            }
            return Err(err.into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> Result<()> {
        // No advisory locking on this platform; the lock file still marks
        // unclean shutdowns.
        Ok(())
    }

    /// Release the lock and remove the lock file (clean shutdown marker).
    pub fn unlock(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        drop(self.file);
        Ok(())
    }
}
