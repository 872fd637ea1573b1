// src/lock.rs

//! Single-instance process locks
//!
//! Two locks keep update work from overlapping:
//!
//! - **Updater lock** (`[updater] lock_path`): held by the updater service for
//!   its whole lifetime, so only one updater answers on the appliance.
//! - **Install lock** (`[paths] install_lock`): held by `armnas apply` while
//!   it mutates the installation.
//!
//! Both are `flock(LOCK_EX)` locks taken with `fs2`. The kernel drops them
//! when the holder exits, so a crashed holder never leaves a stale lock. A
//! `<name>.pid` file next to the lock records the holder for error messages.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive lock held until dropped
#[derive(Debug)]
pub struct ProcessLock {
    // Kept open to keep the lock
    _file: File,
    path: PathBuf,
    purpose: &'static str,
}

impl ProcessLock {
    fn open(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Never truncate: the file may be locked by someone else
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?)
    }

    /// Take the lock or fail with `Conflict` naming the holder
    pub fn try_acquire(path: impl AsRef<Path>, purpose: &'static str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                log::info!("Acquired {} lock at {:?}", purpose, path);
                Self::locked(file, path, purpose)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let holder = match Self::holder_pid(&path) {
                    Some(pid) => format!(" by pid {}", pid),
                    None => String::new(),
                };
                log::debug!("{} lock at {:?} is held{}", purpose, path, holder);
                Err(Error::Conflict(format!(
                    "Another {} is already running (lock {} held{})",
                    purpose,
                    path.display(),
                    holder
                )))
            }
            Err(e) => Err(Error::IoError(format!(
                "Failed to try-acquire {} lock: {}",
                purpose, e
            ))),
        }
    }

    fn locked(file: File, path: PathBuf, purpose: &'static str) -> Result<Self> {
        let lock = Self {
            _file: file,
            path,
            purpose,
        };
        fs::write(lock.pid_path(), std::process::id().to_string())?;
        Ok(lock)
    }

    /// PID recorded by the current holder, if any
    pub fn holder_pid(lock_path: impl AsRef<Path>) -> Option<u32> {
        fs::read_to_string(lock_path.as_ref().with_extension("pid"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pid_path(&self) -> PathBuf {
        self.path.with_extension("pid")
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(self.pid_path())
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log::warn!("Failed to remove {:?}: {}", self.pid_path(), e);
        }
        log::info!("Released {} lock at {:?}", self.purpose, self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn is_held(path: &Path) -> bool {
        let Ok(file) = File::open(path) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                FileExt::unlock(&file).unwrap();
                false
            }
            Err(_) => true,
        }
    }

    #[test]
    fn test_second_holder_conflicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("updater.lock");

        let lock = ProcessLock::try_acquire(&path, "updater").unwrap();
        assert!(is_held(&path));
        assert_eq!(ProcessLock::holder_pid(&path), Some(std::process::id()));

        let err = ProcessLock::try_acquire(&path, "updater").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(err.to_string().contains(&std::process::id().to_string()));

        drop(lock);
        assert!(!is_held(&path));
        assert!(ProcessLock::holder_pid(&path).is_none());
        assert!(ProcessLock::try_acquire(&path, "updater").is_ok());
    }

    #[test]
    fn test_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/armnas/install.lock");

        let lock = ProcessLock::try_acquire(&path, "install").unwrap();
        assert_eq!(lock.path(), path);
        assert!(path.exists());
    }

    #[test]
    fn test_missing_lock_not_held() {
        let dir = TempDir::new().unwrap();
        assert!(!is_held(&dir.path().join("none.lock")));
    }
}
