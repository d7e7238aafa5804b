//! Per-user baseline cache file with exclusive locking.
//!
//! One file per user and technology. Every read-decide-write cycle runs
//! under a blocking `flock(LOCK_EX)` held by a [`CacheGuard`], so
//! concurrent invocations by the same user serialize instead of
//! interleaving.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::netlink::error::{Error, Result};
use crate::smc::stats::{CounterSnapshot, Technology};

/// Location of a per-user baseline file.
#[derive(Debug, Clone)]
pub struct CounterCache {
    path: PathBuf,
}

impl CounterCache {
    /// Cache for the invoking user and the given technology.
    pub fn for_user(tech: Technology) -> Self {
        // SAFETY: getuid has no preconditions and cannot fail.
        let uid = unsafe { libc::getuid() };
        Self {
            path: std::env::temp_dir().join(format!(".smc-stats-{}.u{}", tech, uid)),
        }
    }

    /// Cache at an explicit path.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the cache file, creating it empty if absent, and take the
    /// exclusive lock. Blocks until the lock is granted.
    pub fn open(&self) -> Result<CacheGuard> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| Error::Cache(format!("open {}: {}", self.path.display(), e)))?;
        lock_exclusive(&file)
            .map_err(|e| Error::Cache(format!("lock {}: {}", self.path.display(), e)))?;
        Ok(CacheGuard {
            file,
            path: self.path.clone(),
            unlinked: false,
        })
    }
}

/// An open, exclusively locked cache file. The lock is held until the
/// guard is dropped.
pub struct CacheGuard {
    file: File,
    path: PathBuf,
    unlinked: bool,
}

impl CacheGuard {
    /// Load the persisted baseline. An empty file is a missing baseline,
    /// not an error; anything unparseable is a cache failure.
    pub fn load(&mut self) -> Result<Option<CounterSnapshot>> {
        let mut contents = String::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_string(&mut contents))
            .map_err(|e| Error::Cache(format!("read {}: {}", self.path.display(), e)))?;
        if contents.trim().is_empty() {
            return Ok(None);
        }
        let snapshot = serde_json::from_str(&contents)
            .map_err(|e| Error::Cache(format!("parse {}: {}", self.path.display(), e)))?;
        Ok(Some(snapshot))
    }

    /// Overwrite the baseline with `snapshot`.
    pub fn store(&mut self, snapshot: &CounterSnapshot) -> Result<()> {
        if self.unlinked {
            // The old inode is gone; recreate the file and move the lock
            // over before writing.
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)
                .map_err(|e| Error::Cache(format!("recreate {}: {}", self.path.display(), e)))?;
            lock_exclusive(&file)
                .map_err(|e| Error::Cache(format!("lock {}: {}", self.path.display(), e)))?;
            self.file = file;
            self.unlinked = false;
        }

        let contents = serde_json::to_string(snapshot)
            .map_err(|e| Error::Cache(format!("encode baseline: {}", e)))?;
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.set_len(0))
            .and_then(|_| self.file.write_all(contents.as_bytes()))
            .and_then(|_| self.file.flush())
            .map_err(|e| Error::Cache(format!("write {}: {}", self.path.display(), e)))
    }

    /// Delete the baseline file. The guard stays usable; a subsequent
    /// [`store`](Self::store) recreates the file.
    pub fn discard(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                self.unlinked = true;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.unlinked = true;
                Ok(())
            }
            Err(e) => Err(Error::Cache(format!(
                "remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        // SAFETY: the descriptor is owned by self.file and still open.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn lock_exclusive(file: &File) -> std::io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by the caller and open.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}
