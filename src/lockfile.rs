//! Repository lockfiles.
//!
//! Each hosted repository is guarded by an advisory file lock on
//! `<repo>/githttp.lock`: readers (pulls, browse) take it shared, a push's
//! commit phase takes it exclusive. Advisory OS locks mean independent server
//! processes on the same root coordinate too, not just threads.
//!
//! Promotion is not atomic: releasing a shared lock and acquiring the
//! exclusive one are two separate syscalls, so any state cached under the
//! shared lock must be re-read after promotion. The handle cache treats a
//! contended `try_rlock` as exactly that invalidation signal.
//!
//! A [`LockfileManager`] pools the open descriptors through the keyed pool so
//! a busy repository does not reopen its lockfile inode on every request;
//! eviction closes the descriptor.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use crate::{
    errors::GitError,
    pool::{KeyedPool, PoolOptions},
};

/// File name of the lock inside a repository directory.
pub const LOCKFILE_NAME: &str = "githttp.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    ReadLocked,
    WriteLocked,
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn open_lock_file(path: &str) -> Result<File, GitError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)
        .map_err(|e| GitError::Lockfile(format!("open {path}: {e}")))
}

/// One acquired-or-acquirable lock on a repository.
pub struct Lockfile {
    file: Option<File>,
    key: String,
    state: LockState,
    pool: Arc<KeyedPool<File>>,
}

impl Lockfile {
    pub fn state(&self) -> LockState {
        self.state
    }

    fn file(&self) -> Result<&File, GitError> {
        self.file
            .as_ref()
            .ok_or_else(|| GitError::Lockfile("descriptor already released".to_string()))
    }

    fn acquire(&mut self, operation: libc::c_int, state: LockState) -> Result<(), GitError> {
        flock(self.file()?, operation)
            .map_err(|e| GitError::Lockfile(format!("{}: {e}", self.key)))?;
        self.state = state;
        Ok(())
    }

    fn try_acquire(&mut self, operation: libc::c_int, state: LockState) -> Result<bool, GitError> {
        match flock(self.file()?, operation | libc::LOCK_NB) {
            Ok(()) => {
                self.state = state;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(GitError::Lockfile(format!("{}: {e}", self.key))),
        }
    }

    /// Non-blocking shared lock; `Ok(false)` on contention.
    pub fn try_rlock(&mut self) -> Result<bool, GitError> {
        self.try_acquire(libc::LOCK_SH, LockState::ReadLocked)
    }

    /// Blocking shared lock.
    pub fn rlock(&mut self) -> Result<(), GitError> {
        self.acquire(libc::LOCK_SH, LockState::ReadLocked)
    }

    /// Non-blocking exclusive lock; `Ok(false)` on contention.
    pub fn try_lock(&mut self) -> Result<bool, GitError> {
        self.try_acquire(libc::LOCK_EX, LockState::WriteLocked)
    }

    /// Blocking exclusive lock. When promoting from a shared lock the two
    /// steps are not atomic; re-verify cached state afterward.
    pub fn lock(&mut self) -> Result<(), GitError> {
        self.acquire(libc::LOCK_EX, LockState::WriteLocked)
    }

    /// Release the lock and return the descriptor to the manager's pool.
    pub fn unlock(&mut self) -> Result<(), GitError> {
        let file = self
            .file
            .take()
            .ok_or_else(|| GitError::Lockfile("descriptor already released".to_string()))?;
        flock(&file, libc::LOCK_UN).map_err(|e| GitError::Lockfile(format!("{}: {e}", self.key)))?;
        self.state = LockState::Unlocked;
        self.pool.put(self.key.clone(), file);
        Ok(())
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        // Forgotten unlock: release the OS lock and close the descriptor
        // instead of pooling it.
        if let Some(file) = self.file.take() {
            if self.state != LockState::Unlocked {
                tracing::debug!(key = %self.key, "lockfile dropped while locked");
                let _ = flock(&file, libc::LOCK_UN);
            }
        }
    }
}

/// Owns the pooled lockfile descriptors for every repository this process
/// has touched.
pub struct LockfileManager {
    fds: Arc<KeyedPool<File>>,
}

impl Default for LockfileManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockfileManager {
    pub fn new() -> Self {
        Self {
            fds: Arc::new(KeyedPool::new(PoolOptions {
                new: Some(Box::new(open_lock_file)),
                ..Default::default()
            })),
        }
    }

    /// Obtain an (unlocked) lockfile for the repository at `repo_path`,
    /// creating `<repo>/githttp.lock` on first use.
    pub fn open(&self, repo_path: &Path) -> Result<Lockfile, GitError> {
        let key = repo_path.join(LOCKFILE_NAME).to_string_lossy().into_owned();
        let file = self.fds.get(&key)?;
        Ok(Lockfile {
            file: Some(file),
            key,
            state: LockState::Unlocked,
            pool: Arc::clone(&self.fds),
        })
    }

    /// Number of pooled descriptors (not counting ones currently lent out).
    pub fn pooled(&self) -> usize {
        self.fds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creates_file_with_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let manager = LockfileManager::new();
        let mut lock = manager.open(dir.path()).unwrap();
        lock.rlock().unwrap();
        let lock_path = dir.path().join(LOCKFILE_NAME);
        assert!(lock_path.exists());
        let mode = std::fs::metadata(&lock_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        lock.unlock().unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockfileManager::new();
        let mut a = manager.open(dir.path()).unwrap();
        let mut b = manager.open(dir.path()).unwrap();
        a.rlock().unwrap();
        assert!(b.try_rlock().unwrap());
        assert_eq!(a.state(), LockState::ReadLocked);
        assert_eq!(b.state(), LockState::ReadLocked);
        a.unlock().unwrap();
        b.unlock().unwrap();
    }

    #[test]
    fn test_exclusive_contends_with_shared() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockfileManager::new();
        let mut reader = manager.open(dir.path()).unwrap();
        let mut writer = manager.open(dir.path()).unwrap();
        reader.rlock().unwrap();
        assert!(!writer.try_lock().unwrap());
        reader.unlock().unwrap();
        assert!(writer.try_lock().unwrap());
        assert_eq!(writer.state(), LockState::WriteLocked);
        writer.unlock().unwrap();
    }

    #[test]
    fn test_two_exclusive_locks_never_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockfileManager::new();
        let mut first = manager.open(dir.path()).unwrap();
        let mut second = manager.open(dir.path()).unwrap();
        first.lock().unwrap();
        assert!(!second.try_lock().unwrap());
        first.unlock().unwrap();
        assert!(second.try_lock().unwrap());
        second.unlock().unwrap();
    }

    #[test]
    fn test_unlock_returns_descriptor_to_pool() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockfileManager::new();
        let mut lock = manager.open(dir.path()).unwrap();
        lock.rlock().unwrap();
        assert_eq!(manager.pooled(), 0);
        lock.unlock().unwrap();
        assert_eq!(manager.pooled(), 1);
        // The next open reuses the pooled descriptor.
        let mut again = manager.open(dir.path()).unwrap();
        assert_eq!(manager.pooled(), 0);
        again.lock().unwrap();
        again.unlock().unwrap();
    }

    #[test]
    fn test_double_unlock_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockfileManager::new();
        let mut lock = manager.open(dir.path()).unwrap();
        lock.rlock().unwrap();
        lock.unlock().unwrap();
        assert!(lock.unlock().is_err());
    }
}
