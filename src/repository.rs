//! Repository handles and the process-wide handle cache.
//!
//! Opening a repository is expensive, so open handles are recycled through the
//! keyed pool. A pooled handle carries cached state (the reference list) that
//! is only trustworthy if no writer got in between; the signal for that is the
//! shared lock. A pooled handle whose `try_rlock` contends is thrown away and
//! a fresh one is opened under a blocking shared lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    errors::GitError,
    hash::ObjectId,
    lockfile::{Lockfile, LockfileManager},
    odb::ObjectDatabase,
    pool::{KeyedPool, PoolOptions},
};

/// An open repository: its on-disk path plus its object database.
#[derive(Clone)]
pub struct Repository {
    pub path: PathBuf,
    pub odb: Arc<dyn ObjectDatabase>,
}

impl Repository {
    pub fn new(path: impl Into<PathBuf>, odb: Arc<dyn ObjectDatabase>) -> Self {
        Self {
            path: path.into(),
            odb,
        }
    }
}

/// Opens repositories by physical path; supplied by the embedder.
#[async_trait]
pub trait RepositoryOpener: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Repository, GitError>;
}

/// Opener over a fixed path → object-database map. Used by the test suite and
/// by embedders whose repositories are registered up front.
#[derive(Default)]
pub struct StaticOpener {
    repos: Mutex<BTreeMap<PathBuf, Arc<dyn ObjectDatabase>>>,
}

impl StaticOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: impl Into<PathBuf>, odb: Arc<dyn ObjectDatabase>) {
        self.repos.lock().unwrap().insert(path.into(), odb);
    }
}

#[async_trait]
impl RepositoryOpener for StaticOpener {
    async fn open(&self, path: &Path) -> Result<Repository, GitError> {
        let repos = self.repos.lock().unwrap();
        match repos.get(path) {
            Some(odb) => Ok(Repository::new(path, Arc::clone(odb))),
            None => Err(GitError::not_found(path.display().to_string())),
        }
    }
}

/// What actually sits in the pool between requests.
struct PooledRepository {
    repository: Repository,
    cached_refs: Option<BTreeMap<String, ObjectId>>,
}

/// A repository checked out to one request, shared-locked on arrival.
pub struct RepositoryHandle {
    repository: Repository,
    lock: Lockfile,
    cached_refs: Option<BTreeMap<String, ObjectId>>,
    do_not_return: bool,
}

impl RepositoryHandle {
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn odb(&self) -> &dyn ObjectDatabase {
        self.repository.odb.as_ref()
    }

    pub fn odb_arc(&self) -> Arc<dyn ObjectDatabase> {
        Arc::clone(&self.repository.odb)
    }

    pub fn path(&self) -> &Path {
        &self.repository.path
    }

    pub fn lock_mut(&mut self) -> &mut Lockfile {
        &mut self.lock
    }

    /// The repository's references, cached on the handle for the duration of
    /// the continuously held shared lock.
    pub async fn references(&mut self) -> Result<BTreeMap<String, ObjectId>, GitError> {
        if self.cached_refs.is_none() {
            self.cached_refs = Some(self.repository.odb.references().await?);
        }
        Ok(self.cached_refs.clone().expect("just cached"))
    }

    /// Drop the cached reference list. Required after any lock promotion,
    /// since `rlock → lock` is not atomic.
    pub fn invalidate_cached_refs(&mut self) {
        self.cached_refs = None;
    }

    /// Keep this handle out of the pool on release (cached state may no
    /// longer describe the on-disk repository).
    pub fn mark_do_not_return(&mut self) {
        self.do_not_return = true;
    }
}

/// Keyed cache of open repository handles.
pub struct RepositoryCache {
    handles: KeyedPool<PooledRepository>,
    opener: Arc<dyn RepositoryOpener>,
    locks: Arc<LockfileManager>,
}

impl RepositoryCache {
    pub fn new(opener: Arc<dyn RepositoryOpener>, locks: Arc<LockfileManager>) -> Self {
        Self {
            handles: KeyedPool::new(PoolOptions::default()),
            opener,
            locks,
        }
    }

    /// Obtain a shared-locked handle for the repository at `path`.
    pub async fn open(&self, path: &Path) -> Result<RepositoryHandle, GitError> {
        let key = path.to_string_lossy().into_owned();

        if let Ok(pooled) = self.handles.get(&key) {
            let mut lock = self.locks.open(path)?;
            if lock.try_rlock()? {
                return Ok(RepositoryHandle {
                    repository: pooled.repository,
                    lock,
                    cached_refs: pooled.cached_refs,
                    do_not_return: false,
                });
            }
            // A writer is (or was) active: whatever this handle cached may be
            // stale. Discard it and open fresh under a blocking rlock.
            tracing::debug!(path = %path.display(), "lock contention, discarding pooled handle");
            drop(pooled);
            let repository = self.opener.open(path).await?;
            lock.rlock()?;
            return Ok(RepositoryHandle {
                repository,
                lock,
                cached_refs: None,
                do_not_return: false,
            });
        }

        // Unknown repositories fail here, before any lockfile is created.
        let repository = self.opener.open(path).await?;
        let mut lock = self.locks.open(path)?;
        lock.rlock()?;
        Ok(RepositoryHandle {
            repository,
            lock,
            cached_refs: None,
            do_not_return: false,
        })
    }

    /// Release a handle: drop its lock, then pool it unless flagged.
    pub fn release(&self, mut handle: RepositoryHandle) -> Result<(), GitError> {
        handle.lock.unlock()?;
        if !handle.do_not_return {
            let key = handle.repository.path.to_string_lossy().into_owned();
            self.handles.put(
                key,
                PooledRepository {
                    repository: handle.repository,
                    cached_refs: handle.cached_refs,
                },
            );
        }
        Ok(())
    }

    /// Throw away every pooled handle for `path`. A push calls this after its
    /// commit phase so no reader resurrects pre-push cached state.
    pub fn evict(&self, path: &Path) {
        self.handles.remove(&path.to_string_lossy());
    }

    /// Test teardown: drop every pooled handle.
    pub fn clear(&self) {
        self.handles.clear();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::odb::MemoryOdb;

    fn cache_with_repo() -> (tempfile::TempDir, Arc<StaticOpener>, RepositoryCache) {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(StaticOpener::new());
        opener.register(dir.path(), Arc::new(MemoryOdb::new()));
        let cache = RepositoryCache::new(
            Arc::clone(&opener) as Arc<dyn RepositoryOpener>,
            Arc::new(LockfileManager::new()),
        );
        (dir, opener, cache)
    }

    #[tokio::test]
    async fn test_open_release_reuses_handle() {
        let (dir, _opener, cache) = cache_with_repo();
        let handle = cache.open(dir.path()).await.unwrap();
        assert!(cache.is_empty());
        cache.release(handle).unwrap();
        assert_eq!(cache.len(), 1);
        let handle = cache.open(dir.path()).await.unwrap();
        assert!(cache.is_empty());
        cache.release(handle).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_repository_is_not_found() {
        let (_dir, _opener, cache) = cache_with_repo();
        let bogus = std::env::temp_dir().join("githttp-no-such-repo");
        assert!(matches!(cache.open(&bogus).await, Err(GitError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_flagged_handle_is_not_pooled() {
        let (dir, _opener, cache) = cache_with_repo();
        let mut handle = cache.open(dir.path()).await.unwrap();
        handle.mark_do_not_return();
        cache.release(handle).unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_evict_clears_pooled_handles() {
        let (dir, _opener, cache) = cache_with_repo();
        let handle = cache.open(dir.path()).await.unwrap();
        cache.release(handle).unwrap();
        assert_eq!(cache.len(), 1);
        cache.evict(dir.path());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cached_refs_survive_pooling() {
        let (dir, opener, cache) = cache_with_repo();
        let odb = Arc::new(MemoryOdb::new());
        odb.force_reference("refs/heads/master", ObjectId::hash_bytes(b"tip"));
        opener.register(dir.path(), odb);
        // First pooled entry has no odb refs; re-register above only affects
        // fresh opens, so force a fresh open by clearing.
        cache.clear();

        let mut handle = cache.open(dir.path()).await.unwrap();
        let refs = handle.references().await.unwrap();
        assert_eq!(refs.len(), 1);
        cache.release(handle).unwrap();

        let mut handle = cache.open(dir.path()).await.unwrap();
        let refs = handle.references().await.unwrap();
        assert!(refs.contains_key("refs/heads/master"));
        cache.release(handle).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_contended_pooled_handle_is_discarded() {
        let (dir, _opener, cache) = cache_with_repo();
        let handle = cache.open(dir.path()).await.unwrap();
        cache.release(handle).unwrap();
        assert_eq!(cache.len(), 1);

        // Simulate an active writer in another process.
        let locks = LockfileManager::new();
        let mut writer = locks.open(dir.path()).unwrap();
        writer.lock().unwrap();

        // The pooled handle contends; open must fall back to a fresh handle
        // and block on rlock, so run it on another task and release the
        // writer after a beat.
        let open_task = {
            let path = dir.path().to_path_buf();
            async move { cache.open(&path).await }
        };
        let (opened, ()) = tokio::join!(open_task, async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            tokio::task::spawn_blocking(move || {
                writer.unlock().unwrap();
            })
            .await
            .unwrap();
        });
        let handle = opened.unwrap();
        assert!(handle.cached_refs.is_none());
    }
}
