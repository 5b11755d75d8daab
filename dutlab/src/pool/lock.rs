//! Host-local reservation locks backed by `flock(2)`.
//!
//! The kernel drops the lock when the holder exits, so a crashed session
//! never strands a device. Releasing never unlinks the file: another
//! process may already hold a fresh lock on it.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::LabError;

/// Exclusive claim on a lock file, held until released or dropped
pub struct HostLock {
    file: Option<File>,
    path: PathBuf,
}

impl fmt::Debug for HostLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLock")
            .field("path", &self.path)
            .field("held", &self.is_held())
            .finish()
    }
}

impl HostLock {
    /// Try to take the lock without blocking. `Ok(None)` means busy.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LabError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if !try_flock_exclusive(&file)? {
            return Ok(None);
        }

        // Holder pid, for whoever inspects a busy lock by hand
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        debug!("Acquired lock {}", path.display());
        Ok(Some(Self {
            file: Some(file),
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            unlock(&file);
            debug!("Released lock {}", self.path.display());
        }
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        self.release();
    }
}

pub(crate) fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

/// Blocking variant of [`try_flock_exclusive`]
pub(crate) fn flock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: as above.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: as above. Closing the file would unlock as well.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}
