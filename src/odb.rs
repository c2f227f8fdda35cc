//! The object database contract.
//!
//! The protocol handlers never touch object storage directly; they speak to an
//! [`ObjectDatabase`] that provides object lookup, typed reads, reference
//! access, and the pack indexing/committing operations the push pipeline
//! drives. Storage-level concerns (loose objects, pack directories, alternates
//! on disk) live behind this trait.
//!
//! [`MemoryOdb`] is the bundled reference backend: a complete in-memory
//! implementation used by the test suite and as the destination database for
//! the splice pipeline's freshly built objects.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    errors::GitError,
    hash::ObjectId,
    internal::{
        object::{
            ObjectTrait, blob::Blob, commit::Commit, tree::Tree, types::ObjectType,
        },
        pack::indexer,
    },
};

/// Storage contract between the protocol core and the underlying repository.
#[async_trait]
pub trait ObjectDatabase: Send + Sync {
    /// Whether the object exists (main store or a registered alternate).
    async fn contains(&self, id: ObjectId) -> Result<bool, GitError>;

    /// `(size, type)` of an object, or `ObjectNotFound`.
    async fn object_header(&self, id: ObjectId) -> Result<(u64, ObjectType), GitError>;

    /// Raw object payload without the loose-object header.
    async fn read_raw(&self, id: ObjectId) -> Result<Vec<u8>, GitError>;

    /// Store one object, returning its id.
    async fn write_object(&self, obj_type: ObjectType, data: &[u8]) -> Result<ObjectId, GitError>;

    /// Index an uploaded pack stream into `tmp_dir`, producing
    /// `pack-<hash>.pack` and `pack-<hash>.idx`, and register the side pack as
    /// an alternate backend so its objects are visible to lookups without
    /// being committed.
    async fn index_pack(
        &self,
        pack: Bytes,
        tmp_dir: &Path,
    ) -> Result<(PathBuf, PathBuf), GitError>;

    /// Move a previously indexed pack into the permanent object store
    /// (the writepack sink of the commit phase).
    async fn commit_pack(&self, pack_path: &Path) -> Result<(), GitError>;

    /// Drop every registered alternate without committing it.
    async fn discard_alternates(&self) -> Result<(), GitError>;

    /// Reload storage state and refresh derived indexes (multi-pack index).
    async fn refresh(&self) -> Result<(), GitError>;

    /// All direct references, name-sorted.
    async fn references(&self) -> Result<BTreeMap<String, ObjectId>, GitError>;

    /// Target name of a symbolic HEAD, if one exists (possibly unborn).
    async fn head_symref(&self) -> Result<Option<String>, GitError>;

    /// Resolve a reference name to its object id, following a symbolic HEAD.
    async fn resolve_reference(&self, name: &str) -> Result<Option<ObjectId>, GitError>;

    /// Compare-and-set update of one reference. `expected_old = None` means
    /// the reference must not exist yet.
    async fn update_reference(
        &self,
        name: &str,
        expected_old: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<(), GitError>;

    /// Typed commit read. The default goes through `object_header` and
    /// `read_raw`; override only for storage that caches parsed objects.
    async fn read_commit(&self, id: ObjectId) -> Result<Commit, GitError> {
        let (_, obj_type) = self.object_header(id).await?;
        if obj_type != ObjectType::Commit {
            return Err(GitError::ObjectNotFound(format!("{id} is not a commit")));
        }
        Commit::from_bytes(&self.read_raw(id).await?, id)
    }

    /// Typed tree read.
    async fn read_tree(&self, id: ObjectId) -> Result<Tree, GitError> {
        let (_, obj_type) = self.object_header(id).await?;
        if obj_type != ObjectType::Tree {
            return Err(GitError::ObjectNotFound(format!("{id} is not a tree")));
        }
        Tree::from_bytes(&self.read_raw(id).await?, id)
    }

    /// Typed blob read.
    async fn read_blob(&self, id: ObjectId) -> Result<Blob, GitError> {
        let (_, obj_type) = self.object_header(id).await?;
        if obj_type != ObjectType::Blob {
            return Err(GitError::ObjectNotFound(format!("{id} is not a blob")));
        }
        Blob::from_bytes(&self.read_raw(id).await?, id)
    }

    /// Whether the object exists and is a commit.
    async fn commit_exists(&self, id: ObjectId) -> Result<bool, GitError> {
        match self.object_header(id).await {
            Ok((_, ObjectType::Commit)) => Ok(true),
            Ok(_) => Ok(false),
            Err(GitError::ObjectNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[derive(Default)]
struct MemoryOdbInner {
    objects: HashMap<ObjectId, (ObjectType, Vec<u8>)>,
    /// Objects visible through registered alternates, not yet committed.
    staged: HashMap<ObjectId, (ObjectType, Vec<u8>)>,
    refs: BTreeMap<String, ObjectId>,
    head: Option<String>,
}

/// Complete in-memory [`ObjectDatabase`].
#[derive(Default)]
pub struct MemoryOdb {
    inner: RwLock<MemoryOdbInner>,
}

impl MemoryOdb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob directly (test and splice setup convenience).
    pub fn put_blob(&self, blob: Blob) -> ObjectId {
        let id = blob.id;
        self.inner
            .write()
            .unwrap()
            .objects
            .insert(id, (ObjectType::Blob, blob.data));
        id
    }

    pub fn put_tree(&self, tree: Tree) -> ObjectId {
        let id = tree.id;
        let data = tree.to_data().unwrap();
        self.inner
            .write()
            .unwrap()
            .objects
            .insert(id, (ObjectType::Tree, data));
        id
    }

    pub fn put_commit(&self, commit: Commit) -> ObjectId {
        let id = commit.id;
        let data = commit.to_data().unwrap();
        self.inner
            .write()
            .unwrap()
            .objects
            .insert(id, (ObjectType::Commit, data));
        id
    }

    /// Point HEAD at a reference name (which may not exist yet: unborn HEAD).
    pub fn set_head_symref(&self, name: impl Into<String>) {
        self.inner.write().unwrap().head = Some(name.into());
    }

    /// Set a reference unconditionally (test setup; pushes go through the
    /// compare-and-set path).
    pub fn force_reference(&self, name: impl Into<String>, target: ObjectId) {
        self.inner.write().unwrap().refs.insert(name.into(), target);
    }

    fn lookup(&self, id: ObjectId) -> Option<(ObjectType, Vec<u8>)> {
        let inner = self.inner.read().unwrap();
        inner
            .objects
            .get(&id)
            .or_else(|| inner.staged.get(&id))
            .cloned()
    }
}

#[async_trait]
impl ObjectDatabase for MemoryOdb {
    async fn contains(&self, id: ObjectId) -> Result<bool, GitError> {
        Ok(self.lookup(id).is_some())
    }

    async fn object_header(&self, id: ObjectId) -> Result<(u64, ObjectType), GitError> {
        match self.lookup(id) {
            Some((obj_type, data)) => Ok((data.len() as u64, obj_type)),
            None => Err(GitError::ObjectNotFound(id.to_string())),
        }
    }

    async fn read_raw(&self, id: ObjectId) -> Result<Vec<u8>, GitError> {
        match self.lookup(id) {
            Some((_, data)) => Ok(data),
            None => Err(GitError::ObjectNotFound(id.to_string())),
        }
    }

    async fn write_object(&self, obj_type: ObjectType, data: &[u8]) -> Result<ObjectId, GitError> {
        let id = ObjectId::from_type_and_data(obj_type, data);
        self.inner
            .write()
            .unwrap()
            .objects
            .insert(id, (obj_type, data.to_vec()));
        Ok(id)
    }

    async fn index_pack(
        &self,
        pack: Bytes,
        tmp_dir: &Path,
    ) -> Result<(PathBuf, PathBuf), GitError> {
        let (entries, pack_hash) = indexer::read_pack(&pack)?;
        let (pack_path, idx_path) =
            indexer::write_pack_and_index(tmp_dir, &pack, &entries, pack_hash)?;

        let mut inner = self.inner.write().unwrap();
        for unpacked in entries {
            inner.staged.insert(
                unpacked.entry.hash,
                (unpacked.entry.obj_type, unpacked.entry.data),
            );
        }
        Ok((pack_path, idx_path))
    }

    async fn commit_pack(&self, pack_path: &Path) -> Result<(), GitError> {
        let data = tokio::fs::read(pack_path).await?;
        let (entries, _) = indexer::read_pack(&data)?;
        let mut inner = self.inner.write().unwrap();
        for unpacked in entries {
            inner.staged.remove(&unpacked.entry.hash);
            inner.objects.insert(
                unpacked.entry.hash,
                (unpacked.entry.obj_type, unpacked.entry.data),
            );
        }
        Ok(())
    }

    async fn discard_alternates(&self) -> Result<(), GitError> {
        self.inner.write().unwrap().staged.clear();
        Ok(())
    }

    async fn refresh(&self) -> Result<(), GitError> {
        // Nothing derived to rebuild for the in-memory store.
        Ok(())
    }

    async fn references(&self) -> Result<BTreeMap<String, ObjectId>, GitError> {
        Ok(self.inner.read().unwrap().refs.clone())
    }

    async fn head_symref(&self) -> Result<Option<String>, GitError> {
        Ok(self.inner.read().unwrap().head.clone())
    }

    async fn resolve_reference(&self, name: &str) -> Result<Option<ObjectId>, GitError> {
        let inner = self.inner.read().unwrap();
        if name == "HEAD" {
            return Ok(match &inner.head {
                Some(target) => inner.refs.get(target).copied(),
                None => inner.refs.get("HEAD").copied(),
            });
        }
        Ok(inner.refs.get(name).copied())
    }

    async fn update_reference(
        &self,
        name: &str,
        expected_old: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<(), GitError> {
        if new.is_zero() {
            return Err(GitError::DeleteUnallowed);
        }
        let mut inner = self.inner.write().unwrap();
        let current = inner.refs.get(name).copied();
        match (expected_old, current) {
            (None, Some(_)) => return Err(GitError::StaleInfo),
            (Some(_), None) => return Err(GitError::StaleInfo),
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(GitError::StaleInfo);
            }
            _ => {}
        }
        inner.refs.insert(name.to_string(), new);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::pack::{encode::PackEncoder, entry::Entry};

    #[tokio::test]
    async fn test_object_lifecycle() {
        let odb = MemoryOdb::new();
        let blob = Blob::from_content("hello");
        let id = odb.write_object(ObjectType::Blob, &blob.data).await.unwrap();
        assert_eq!(id, blob.id);
        assert!(odb.contains(id).await.unwrap());
        assert_eq!(
            odb.object_header(id).await.unwrap(),
            (5, ObjectType::Blob)
        );
        assert_eq!(odb.read_blob(id).await.unwrap().data, b"hello");
        // Typed read enforces the type.
        assert!(odb.read_commit(id).await.is_err());
        assert!(!odb.commit_exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_staging_is_visible_until_discarded() {
        let odb = MemoryOdb::new();
        let blob = Blob::from_content("staged");
        let mut encoder = PackEncoder::new();
        encoder.insert(Entry::from(blob.clone()));
        let (pack, _) = encoder.encode().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (pack_path, idx_path) = odb
            .index_pack(Bytes::from(pack), dir.path())
            .await
            .unwrap();
        assert!(idx_path.exists());
        assert!(odb.contains(blob.id).await.unwrap());

        odb.discard_alternates().await.unwrap();
        assert!(!odb.contains(blob.id).await.unwrap());

        // Committing the same pack makes the object permanent.
        let (entries_pack, _) = {
            let mut encoder = PackEncoder::new();
            encoder.insert(Entry::from(blob.clone()));
            encoder.encode().unwrap()
        };
        let (pack_path2, _) = odb
            .index_pack(Bytes::from(entries_pack), dir.path())
            .await
            .unwrap();
        assert_eq!(pack_path, pack_path2);
        odb.commit_pack(&pack_path2).await.unwrap();
        odb.discard_alternates().await.unwrap();
        assert!(odb.contains(blob.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reference_compare_and_set() {
        let odb = MemoryOdb::new();
        let a = ObjectId::hash_bytes(b"a");
        let b = ObjectId::hash_bytes(b"b");

        // Create requires absence.
        odb.update_reference("refs/heads/master", None, a)
            .await
            .unwrap();
        assert!(matches!(
            odb.update_reference("refs/heads/master", None, b).await,
            Err(GitError::StaleInfo)
        ));

        // Update requires the expected old value.
        assert!(matches!(
            odb.update_reference("refs/heads/master", Some(b), a).await,
            Err(GitError::StaleInfo)
        ));
        odb.update_reference("refs/heads/master", Some(a), b)
            .await
            .unwrap();
        assert_eq!(
            odb.resolve_reference("refs/heads/master").await.unwrap(),
            Some(b)
        );

        // Deletes are refused at the storage seam too.
        assert!(matches!(
            odb.update_reference("refs/heads/master", Some(b), ObjectId::ZERO)
                .await,
            Err(GitError::DeleteUnallowed)
        ));
    }

    #[tokio::test]
    async fn test_head_resolution() {
        let odb = MemoryOdb::new();
        odb.set_head_symref("refs/heads/master");
        // Unborn HEAD resolves to nothing.
        assert_eq!(odb.resolve_reference("HEAD").await.unwrap(), None);
        let tip = ObjectId::hash_bytes(b"tip");
        odb.force_reference("refs/heads/master", tip);
        assert_eq!(odb.resolve_reference("HEAD").await.unwrap(), Some(tip));
        assert_eq!(
            odb.head_symref().await.unwrap().as_deref(),
            Some("refs/heads/master")
        );
    }
}
