//! Advisory locks on backup trees
//!
//! Every operation that reads or writes a tree takes an exclusive lock on
//! its `lock` file first. Contention fails immediately instead of waiting.

use crate::error::{BackupError, Result};
use crate::tree::layout::LOCK_FILE;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive lock held for the lifetime of the value
#[derive(Debug)]
pub struct TreeLock {
    _file: File,
    path: PathBuf,
}

impl TreeLock {
    /// Lock the tree rooted at `root`, creating the directory if needed
    pub fn acquire(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|_| BackupError::Locked {
            path: root.to_path_buf(),
        })?;

        debug!(path = %path.display(), "Acquired tree lock");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TreeLock {
    fn drop(&mut self) {
        // Closing the file releases the lock
        debug!(path = %self.path.display(), "Releasing tree lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let lock = TreeLock::acquire(dir.path()).unwrap();
        assert!(lock.path().ends_with(LOCK_FILE));

        let second = TreeLock::acquire(dir.path());
        assert!(matches!(second, Err(BackupError::Locked { .. })));

        drop(lock);
        assert!(TreeLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_lock_creates_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("alice");
        let _lock = TreeLock::acquire(&root).unwrap();
        assert!(root.join(LOCK_FILE).exists());
    }
}
