//! Startup mutual exclusion through a locked regular file.
//!
//! The lock file must live in an existing, writable directory; failing
//! to create or lock it is fatal. A second daemon finding the lock held
//! exits with EEXIST.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::CodedError;

/// An exclusive flock on the daemon's lock file.
///
/// The kernel drops the lock when the file closes; [`release`] also
/// removes the file, as a clean shutdown must.
#[derive(Debug)]
pub struct StartupLock {
    _file: File,
    path: PathBuf,
}

impl StartupLock {
    /// Creates (if needed) and locks the file, non-blocking.
    pub fn acquire(path: &Path) -> Result<Self, CodedError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                CodedError::from_io(e, format!("cannot open lock file '{}'", path.display()))
            })?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            if errno == libc::EWOULDBLOCK {
                return Err(CodedError::exists(format!(
                    "another daemon holds the lock file '{}'",
                    path.display()
                )));
            }
            return Err(CodedError::new(
                errno,
                format!("cannot lock '{}'", path.display()),
            ));
        }
        debug!(path = %path.display(), "lock file acquired");
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// Removes the lock file and drops the lock.
    pub fn release(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("spoold.lock");
        let lock = StartupLock::acquire(&path).unwrap();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_is_eexist() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("spoold.lock");
        let _held = StartupLock::acquire(&path).unwrap();
        let err = StartupLock::acquire(&path).unwrap_err();
        assert_eq!(err.code(), libc::EEXIST);
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let err =
            StartupLock::acquire(Path::new("/nonexistent-spool-dir/spoold.lock")).unwrap_err();
        assert_eq!(err.code(), libc::ENOENT);
    }

    #[test]
    fn test_lock_freed_after_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("spoold.lock");
        StartupLock::acquire(&path).unwrap().release();
        let again = StartupLock::acquire(&path).unwrap();
        again.release();
    }
}
