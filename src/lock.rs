//! Cross-process named lock
//!
//! Processes sharing a box serialize store mutation and reload through an
//! exclusive advisory lock on `<box dir>/<name>.lock`. Failing to obtain the
//! lock is logged and the caller proceeds unlocked.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A named lock backed by a lock file
#[derive(Debug, Clone)]
pub struct NamedLock {
    path: PathBuf,
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct NamedLockGuard {
    file: File,
}

impl NamedLock {
    /// Lock named `name` inside `dir`
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{name}.lock")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held; `None` if it could not be obtained
    pub fn acquire(&self) -> Option<NamedLockGuard> {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("Cannot create lock directory {:?}: {}", parent, e);
                return None;
            }
        }

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) => {
                warn!("Cannot open lock file {:?}: {}", self.path, e);
                return None;
            }
        };

        match file.lock_exclusive() {
            Ok(()) => {
                debug!("Acquired {:?}", self.path);
                Some(NamedLockGuard { file })
            }
            Err(e) => {
                warn!("Cannot lock {:?}: {}", self.path, e);
                None
            }
        }
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock: {}", e);
        }
    }
}
