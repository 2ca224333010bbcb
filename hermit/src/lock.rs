//! The cross-process advisory lock guarding the state root.
//!
//! One `flock`-held file serializes every mutation of the package store,
//! cache, and DB. Acquisition is bounded by a timeout; the lock is released
//! on drop so every exit path, including panics, unwinds it.

use std::fs;
use std::os::fd::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::errors::{HermitError, HermitResult};

/// How often acquisition retries while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An acquired advisory file lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct FileLock {
    file: fs::File,
    path: Utf8PathBuf,
}

impl FileLock {
    /// Acquire the exclusive lock at `path`, waiting up to `timeout`.
    ///
    /// The lock is non-reentrant: a process that already holds it must not
    /// acquire it again.
    pub fn acquire(path: &Utf8Path, timeout: Duration) -> HermitResult<FileLock> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new().create(true).truncate(false).write(true).open(path)?;
        let deadline = Instant::now() + timeout;
        loop {
            if try_flock(&file)? {
                debug!("acquired lock {path}");
                return Ok(FileLock { file, path: path.to_owned() });
            }
            if Instant::now() >= deadline {
                return Err(HermitError::LockTimeout { path: path.to_owned(), timeout });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// The lock file path
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

fn try_flock(file: &fs::File) -> HermitResult<bool> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err.into())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        debug!("releasing lock {}", self.path);
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_reacquire() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().join(".lock");

        let lock = FileLock::acquire(&path, Duration::from_secs(1)).unwrap();
        drop(lock);
        let _lock = FileLock::acquire(&path, Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn contention_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().join(".lock");

        // flock is per-open-file, so a second descriptor contends even within
        // one process
        let _held = FileLock::acquire(&path, Duration::from_secs(1)).unwrap();
        let err = FileLock::acquire(&path, Duration::from_millis(250)).unwrap_err();
        assert!(matches!(err, HermitError::LockTimeout { .. }));
    }
}
