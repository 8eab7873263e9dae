//! Sidecar lock files guarding story mutations across processes.
//!
//! A lock is a `<file>.lock` sibling created with `create_new`. Its existence
//! is the whole protocol; a lock older than the staleness threshold whose
//! holder no longer has it flocked is treated as left behind by a crashed
//! process and is reclaimed.

use crate::errors::LockError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Timing knobs for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub stale_after: Duration,
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(10),
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// Path of the sidecar lock for `target`.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

/// A held lock. Dropping it removes the lock file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: Option<File>,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing removal errors that `Drop` would swallow.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner().map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn release_inner(&mut self) -> std::io::Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // Remove while still flocked so a stale check never sees an unlocked orphan.
        let removed = match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
        let _ = FileExt::unlock(&file);
        removed
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
        }
    }
}

/// Acquire the lock for `target`, waiting up to `opts.timeout`.
pub async fn acquire(target: &Path, opts: &LockOptions) -> Result<LockGuard, LockError> {
    let lock_path = lock_path_for(target);
    let started = Instant::now();

    loop {
        match try_create(&lock_path) {
            Ok(guard) => return Ok(guard),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match reclaim_if_stale(&lock_path, opts.stale_after) {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(source) => {
                        return Err(LockError::Io {
                            path: lock_path,
                            source,
                        });
                    }
                }
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: lock_path,
                    source,
                });
            }
        }

        let waited = started.elapsed();
        if waited >= opts.timeout {
            return Err(LockError::Timeout {
                path: target.to_path_buf(),
                waited,
            });
        }
        tokio::time::sleep(opts.retry_interval.min(opts.timeout - waited)).await;
    }
}

fn try_create(lock_path: &Path) -> std::io::Result<LockGuard> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    // From here on, dropping the guard cleans up the file on any error.
    let mut guard = LockGuard {
        path: lock_path.to_path_buf(),
        file: Some(file),
    };
    if let Some(file) = guard.file.as_mut() {
        file.try_lock_exclusive()?;
        writeln!(file, "{}", std::process::id())?;
    }
    Ok(guard)
}

/// Remove the lock file if it is older than `stale_after` and nobody holds it.
/// Returns whether a stale lock was removed (or had already vanished).
fn reclaim_if_stale(lock_path: &Path, stale_after: Duration) -> std::io::Result<bool> {
    let metadata = match std::fs::metadata(lock_path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    let age = metadata
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .unwrap_or_default();
    if age < stale_after {
        return Ok(false);
    }

    let file = match File::open(lock_path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    if file.try_lock_exclusive().is_err() {
        debug!(path = %lock_path.display(), "Old lock is still held by a live process");
        return Ok(false);
    }

    // The path may have been replaced since we opened it.
    let opened = file.metadata()?;
    let still_same = std::fs::metadata(lock_path)
        .map(|current| current.ino() == opened.ino() && current.dev() == opened.dev())
        .unwrap_or(false);
    if still_same {
        warn!(path = %lock_path.display(), age_ms = age.as_millis() as u64, "Reclaiming stale lock");
        match std::fs::remove_file(lock_path) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e),
            _ => {}
        }
    }
    let _ = FileExt::unlock(&file);
    Ok(true)
}
