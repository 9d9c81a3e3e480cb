//! Advisory file lock that keeps a second process away from a store.

use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use crate::error::{Result, SyncError};

/// RAII guard for an exclusive advisory lock on a store's lock file.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Acquire the lock, polling until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StoreLockTimeout`] when another holder keeps the
    /// lock past `timeout`, or an I/O error if the lock file cannot be opened.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let parent = path.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "lock path has no parent")
        })?;
        fs::create_dir_all(parent)?;

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)?;

            if file.try_lock_exclusive().is_ok() {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            if start.elapsed() >= timeout {
                return Err(SyncError::StoreLockTimeout {
                    path: path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::StoreLock;
    use crate::error::{ErrorCode, SyncError};
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    #[test]
    fn lock_times_out_when_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("items.lock");
        let guard = StoreLock::acquire(&path, Duration::from_millis(50)).expect("first lock");
        assert_eq!(guard.path(), path.as_path());

        let err = StoreLock::acquire(&path, Duration::from_millis(20)).expect_err("held");
        assert!(matches!(err, SyncError::StoreLockTimeout { path: ref p, .. } if *p == path));
        assert_eq!(err.code(), ErrorCode::StoreLockTimeout);
    }

    #[test]
    fn release_on_drop_allows_follow_up_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("items.lock");
        {
            let _first = StoreLock::acquire(&path, Duration::from_millis(50)).expect("first");
        }
        assert!(StoreLock::acquire(&path, Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn contention_is_resolved_after_holder_releases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("items.lock");

        let held = Arc::new(Barrier::new(2));
        let done = Arc::new(Barrier::new(2));
        let (held_thread, done_thread) = (Arc::clone(&held), Arc::clone(&done));
        let path_in_thread = path.clone();
        let handle = thread::spawn(move || {
            let _holder = StoreLock::acquire(&path_in_thread, Duration::from_millis(200)).unwrap();
            held_thread.wait();
            done_thread.wait();
        });

        held.wait();
        assert!(StoreLock::acquire(&path, Duration::from_millis(20)).is_err());
        done.wait();
        handle.join().unwrap();

        assert!(StoreLock::acquire(&path, Duration::from_millis(50)).is_ok());
    }
}
