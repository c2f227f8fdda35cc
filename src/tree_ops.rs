//! Tree split and merge.
//!
//! `merge_trees` unions several trees by entry name: same-name subtrees merge
//! recursively with the first tree's content as the base, same-name blobs
//! resolve to the first tree's blob, and a name that is a tree in one input
//! and a blob in another is a hard error. `split_tree` extracts a set of
//! relative paths out of a source tree into a destination object database,
//! copying blobs by value and taken subtrees wholesale while rebuilding the
//! intermediate levels.
//!
//! Both walks charge every visited object against a fixed budget so a
//! pathological tree cannot run the server out of memory mid-splice.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::{
    config::RequestContext,
    errors::GitError,
    hash::ObjectId,
    internal::object::{
        ObjectTrait,
        tree::{Tree, TreeEntry, TreeEntryMode},
        types::ObjectType,
    },
    odb::ObjectDatabase,
};

/// Most objects a single split walk may visit.
pub const OBJECT_LIMIT: usize = 10_000;

struct ObjectBudget {
    used: AtomicUsize,
    limit: usize,
}

impl ObjectBudget {
    fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
        }
    }

    fn charge(&self) -> Result<(), GitError> {
        let used = self.used.fetch_add(1, Ordering::Relaxed) + 1;
        if used > self.limit {
            Err(GitError::TreeExceededObjectLimit(self.limit))
        } else {
            Ok(())
        }
    }
}

/// Merge trees by name, first tree wins on conflicts. The merged tree (and
/// any recursively merged subtree) is written into `odb`.
pub async fn merge_trees(
    odb: &dyn ObjectDatabase,
    ctx: &RequestContext,
    tree_ids: &[ObjectId],
) -> Result<Tree, GitError> {
    let mut trees = Vec::with_capacity(tree_ids.len());
    for id in tree_ids {
        trees.push(odb.read_tree(*id).await?);
    }
    merge_inner(odb, ctx, trees).await
}

fn merge_inner<'a>(
    odb: &'a dyn ObjectDatabase,
    ctx: &'a RequestContext,
    trees: Vec<Tree>,
) -> BoxFuture<'a, Result<Tree, GitError>> {
    async move {
        if trees.len() == 1 {
            // Singleton merge is identity.
            return Ok(trees.into_iter().next().expect("one tree"));
        }

        // Group entries by name, preserving input order within each group.
        let mut groups: BTreeMap<String, Vec<TreeEntry>> = BTreeMap::new();
        for tree in &trees {
            for entry in &tree.entries {
                ctx.ensure_live()?;
                groups.entry(entry.name.clone()).or_default().push(entry.clone());
            }
        }

        let mut merged = Vec::with_capacity(groups.len());
        for (name, group) in groups {
            let first_is_tree = group[0].mode.is_tree();
            if group.iter().any(|e| e.mode.is_tree() != first_is_tree) {
                return Err(GitError::MergeTypeMismatch(name));
            }

            if !first_is_tree {
                // First tree's blob wins.
                merged.push(group.into_iter().next().expect("non-empty group"));
                continue;
            }

            // Distinct subtrees merge recursively; identical ones short-circuit.
            let mut ids: Vec<ObjectId> = group.iter().map(|e| e.id).collect();
            ids.dedup();
            if ids.len() == 1 {
                merged.push(group.into_iter().next().expect("non-empty group"));
                continue;
            }
            let mut subtrees = Vec::with_capacity(ids.len());
            for id in ids {
                subtrees.push(odb.read_tree(id).await?);
            }
            let subtree = merge_inner(odb, ctx, subtrees).await?;
            merged.push(TreeEntry::new(TreeEntryMode::Tree, subtree.id, name));
        }

        let tree = Tree::from_entries(merged)?;
        odb.write_object(ObjectType::Tree, &tree.to_data()?).await?;
        Ok(tree)
    }
    .boxed()
}

/// Build a tree in `dst` containing exactly `paths` (slash-separated,
/// relative to `src_tree`) and everything reachable from them.
pub async fn split_tree(
    src_tree: ObjectId,
    src: &dyn ObjectDatabase,
    paths: &[String],
    dst: &dyn ObjectDatabase,
    ctx: &RequestContext,
) -> Result<Tree, GitError> {
    let budget = ObjectBudget::new(OBJECT_LIMIT);
    split_inner(src, dst, ctx, src_tree, paths.to_vec(), &budget).await
}

fn split_inner<'a>(
    src: &'a dyn ObjectDatabase,
    dst: &'a dyn ObjectDatabase,
    ctx: &'a RequestContext,
    tree_id: ObjectId,
    paths: Vec<String>,
    budget: &'a ObjectBudget,
) -> BoxFuture<'a, Result<Tree, GitError>> {
    async move {
        let tree = src.read_tree(tree_id).await?;

        // Group the wanted paths by leading component so each child of this
        // level is visited once regardless of how many paths share it.
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for path in paths {
            ctx.ensure_live()?;
            match path.split_once('/') {
                Some((head, rest)) => groups
                    .entry(head.to_string())
                    .or_default()
                    .push(rest.to_string()),
                None => {
                    groups.entry(path).or_default();
                }
            }
        }

        let mut entries = Vec::with_capacity(groups.len());
        for (name, children) in groups {
            let entry = tree
                .entry(&name)
                .ok_or_else(|| GitError::ObjectNotFound(format!("{name} in tree {tree_id}")))?
                .clone();

            if children.is_empty() {
                // The path names this entry itself: take it wholesale.
                budget.charge()?;
                if entry.mode.is_tree() {
                    copy_tree(src, dst, ctx, entry.id, budget).await?;
                } else {
                    let data = src.read_raw(entry.id).await?;
                    dst.write_object(ObjectType::Blob, &data).await?;
                }
                entries.push(entry);
            } else {
                if !entry.mode.is_tree() {
                    return Err(GitError::InvalidRef(format!(
                        "path component `{name}` is not a directory"
                    )));
                }
                budget.charge()?;
                let subtree = split_inner(src, dst, ctx, entry.id, children, budget).await?;
                entries.push(TreeEntry::new(TreeEntryMode::Tree, subtree.id, name));
            }
        }

        let tree = Tree::from_entries(entries)?;
        dst.write_object(ObjectType::Tree, &tree.to_data()?).await?;
        Ok(tree)
    }
    .boxed()
}

/// Copy a subtree and everything below it from `src` to `dst`.
fn copy_tree<'a>(
    src: &'a dyn ObjectDatabase,
    dst: &'a dyn ObjectDatabase,
    ctx: &'a RequestContext,
    tree_id: ObjectId,
    budget: &'a ObjectBudget,
) -> BoxFuture<'a, Result<(), GitError>> {
    async move {
        let tree = src.read_tree(tree_id).await?;
        for entry in &tree.entries {
            ctx.ensure_live()?;
            budget.charge()?;
            if entry.mode.is_tree() {
                copy_tree(src, dst, ctx, entry.id, budget).await?;
            } else {
                let data = src.read_raw(entry.id).await?;
                dst.write_object(ObjectType::Blob, &data).await?;
            }
        }
        dst.write_object(ObjectType::Tree, &tree.to_data()?).await?;
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::object::blob::Blob;
    use crate::odb::MemoryOdb;

    fn blob_entry(odb: &MemoryOdb, name: &str, content: &str) -> TreeEntry {
        let blob = Blob::from_content(content);
        odb.put_blob(blob.clone());
        TreeEntry::new(TreeEntryMode::Blob, blob.id, name.to_string())
    }

    fn tree_entry(odb: &MemoryOdb, name: &str, entries: Vec<TreeEntry>) -> TreeEntry {
        let tree = Tree::from_entries(entries).unwrap();
        odb.put_tree(tree.clone());
        TreeEntry::new(TreeEntryMode::Tree, tree.id, name.to_string())
    }

    /// Repository layout used across these tests:
    /// `a.txt`, `docs/guide.md`, `docs/intro.md`, `src/main.rs`.
    fn sample_tree(odb: &MemoryOdb) -> Tree {
        let docs = vec![
            blob_entry(odb, "guide.md", "guide"),
            blob_entry(odb, "intro.md", "intro"),
        ];
        let src = vec![blob_entry(odb, "main.rs", "fn main() {}")];
        let tree = Tree::from_entries(vec![
            blob_entry(odb, "a.txt", "a"),
            tree_entry(odb, "docs", docs),
            tree_entry(odb, "src", src),
        ])
        .unwrap();
        odb.put_tree(tree.clone());
        tree
    }

    #[tokio::test]
    async fn test_singleton_merge_is_identity() {
        let odb = MemoryOdb::new();
        let ctx = RequestContext::new();
        let tree = sample_tree(&odb);
        let merged = merge_trees(&odb, &ctx, &[tree.id]).await.unwrap();
        assert_eq!(merged.id, tree.id);
    }

    #[tokio::test]
    async fn test_merge_unions_disjoint_trees() {
        let odb = MemoryOdb::new();
        let ctx = RequestContext::new();
        let left = Tree::from_entries(vec![blob_entry(&odb, "a", "1")]).unwrap();
        let right = Tree::from_entries(vec![blob_entry(&odb, "b", "2")]).unwrap();
        odb.put_tree(left.clone());
        odb.put_tree(right.clone());
        let merged = merge_trees(&odb, &ctx, &[left.id, right.id]).await.unwrap();
        assert_eq!(merged.entries.len(), 2);
        assert!(merged.entry("a").is_some());
        assert!(merged.entry("b").is_some());
    }

    #[tokio::test]
    async fn test_merge_first_blob_wins() {
        let odb = MemoryOdb::new();
        let ctx = RequestContext::new();
        let first = Tree::from_entries(vec![blob_entry(&odb, "f", "first")]).unwrap();
        let second = Tree::from_entries(vec![blob_entry(&odb, "f", "second")]).unwrap();
        odb.put_tree(first.clone());
        odb.put_tree(second.clone());
        let merged = merge_trees(&odb, &ctx, &[first.id, second.id]).await.unwrap();
        assert_eq!(merged.entry("f").unwrap().id, Blob::from_content("first").id);
    }

    #[tokio::test]
    async fn test_merge_recurses_into_shared_subtrees() {
        let odb = MemoryOdb::new();
        let ctx = RequestContext::new();
        let left = Tree::from_entries(vec![tree_entry(
            &odb,
            "dir",
            vec![blob_entry(&odb, "l", "left")],
        )])
        .unwrap();
        let right = Tree::from_entries(vec![tree_entry(
            &odb,
            "dir",
            vec![blob_entry(&odb, "r", "right")],
        )])
        .unwrap();
        odb.put_tree(left.clone());
        odb.put_tree(right.clone());
        let merged = merge_trees(&odb, &ctx, &[left.id, right.id]).await.unwrap();
        let dir = odb.read_tree(merged.entry("dir").unwrap().id).await.unwrap();
        assert!(dir.entry("l").is_some());
        assert!(dir.entry("r").is_some());
    }

    #[tokio::test]
    async fn test_merge_type_mismatch_fails() {
        let odb = MemoryOdb::new();
        let ctx = RequestContext::new();
        let as_blob = Tree::from_entries(vec![blob_entry(&odb, "x", "blob")]).unwrap();
        let as_tree = Tree::from_entries(vec![tree_entry(&odb, "x", vec![])]).unwrap();
        odb.put_tree(as_blob.clone());
        odb.put_tree(as_tree.clone());
        assert!(matches!(
            merge_trees(&odb, &ctx, &[as_blob.id, as_tree.id]).await,
            Err(GitError::MergeTypeMismatch(name)) if name == "x"
        ));
    }

    #[tokio::test]
    async fn test_split_extracts_blobs_and_subtrees() {
        let src = MemoryOdb::new();
        let dst = MemoryOdb::new();
        let ctx = RequestContext::new();
        let tree = sample_tree(&src);

        let split = split_tree(
            tree.id,
            &src,
            &["a.txt".to_string(), "docs/guide.md".to_string()],
            &dst,
            &ctx,
        )
        .await
        .unwrap();

        assert!(split.entry("a.txt").is_some());
        assert!(split.entry("src").is_none());
        let docs = dst.read_tree(split.entry("docs").unwrap().id).await.unwrap();
        assert!(docs.entry("guide.md").is_some());
        assert!(docs.entry("intro.md").is_none());
        // Copied blobs exist in the destination by value.
        assert!(dst.contains(Blob::from_content("guide").id).await.unwrap());
        assert!(!dst.contains(Blob::from_content("intro").id).await.unwrap());
    }

    #[tokio::test]
    async fn test_split_takes_whole_subtree() {
        let src = MemoryOdb::new();
        let dst = MemoryOdb::new();
        let ctx = RequestContext::new();
        let tree = sample_tree(&src);

        let split = split_tree(tree.id, &src, &["docs".to_string()], &dst, &ctx)
            .await
            .unwrap();
        // The docs subtree is carried over id-identical.
        assert_eq!(split.entry("docs").unwrap().id, tree.entry("docs").unwrap().id);
        assert!(dst.contains(Blob::from_content("intro").id).await.unwrap());
    }

    #[tokio::test]
    async fn test_split_then_merge_restores_partition() {
        let src = MemoryOdb::new();
        let dst = MemoryOdb::new();
        let ctx = RequestContext::new();
        let tree = sample_tree(&src);

        let left = split_tree(
            tree.id,
            &src,
            &["a.txt".to_string(), "docs/guide.md".to_string(), "docs/intro.md".to_string()],
            &dst,
            &ctx,
        )
        .await
        .unwrap();
        let right = split_tree(tree.id, &src, &["src/main.rs".to_string()], &dst, &ctx)
            .await
            .unwrap();

        let merged = merge_trees(&dst, &ctx, &[left.id, right.id]).await.unwrap();
        assert_eq!(merged.id, tree.id);
    }

    #[tokio::test]
    async fn test_split_missing_path_fails() {
        let src = MemoryOdb::new();
        let dst = MemoryOdb::new();
        let ctx = RequestContext::new();
        let tree = sample_tree(&src);
        assert!(matches!(
            split_tree(tree.id, &src, &["nope".to_string()], &dst, &ctx).await,
            Err(GitError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_object_limit_enforced() {
        let src = MemoryOdb::new();
        let dst = MemoryOdb::new();
        let ctx = RequestContext::new();
        // A flat tree with more entries than the budget allows.
        let entries: Vec<TreeEntry> = (0..OBJECT_LIMIT + 1)
            .map(|i| blob_entry(&src, &format!("f{i:05}"), &i.to_string()))
            .collect();
        let tree = Tree::from_entries(entries).unwrap();
        src.put_tree(tree.clone());

        assert!(matches!(
            split_tree(tree.id, &src, &["f00000".to_string()], &dst, &ctx).await,
            Ok(_)
        ));
        // Taking the whole tree wholesale crosses the limit.
        let wrapper = Tree::from_entries(vec![TreeEntry::new(
            TreeEntryMode::Tree,
            tree.id,
            "big".to_string(),
        )])
        .unwrap();
        src.put_tree(wrapper.clone());
        assert!(matches!(
            split_tree(wrapper.id, &src, &["big".to_string()], &dst, &ctx).await,
            Err(GitError::TreeExceededObjectLimit(_))
        ));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_walk() {
        let src = MemoryOdb::new();
        let dst = MemoryOdb::new();
        let ctx = RequestContext::new();
        let tree = sample_tree(&src);
        ctx.cancel();
        assert!(matches!(
            split_tree(tree.id, &src, &["docs".to_string()], &dst, &ctx).await,
            Err(GitError::Cancelled)
        ));
    }
}
