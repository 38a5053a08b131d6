//! Exclusive advisory lock enforcing single-process database access.
//!
//! The lock lives on the database's `lockfile`. It is advisory: only
//! cooperating processes (other stratadb instances) observe it. The OS
//! drops the lock automatically when the file handle closes, so a crashed
//! process never leaves a stale lock behind.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// An exclusive `flock` held for the lifetime of the value.
#[derive(Debug)]
pub(crate) struct FileLock {
    _file: File,
}

impl FileLock {
    /// Create the lock file if needed and take an exclusive non-blocking
    /// lock on it. Fails with `WouldBlock`-style errors when another
    /// process holds the lock.
    ///
    /// The file contents are never written; the lock file stays empty.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(FileLock { _file: file })
    }
}
