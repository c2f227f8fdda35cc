//! Commit splicing.
//!
//! Given one incoming commit, a splice decomposes its tree into buckets by
//! path, creates one derived commit per bucket in a destination repository,
//! and recombines the bucket trees under a merge commit whose parents are the
//! optional base followed by the bucket commits. This implements hosting
//! workflows where a single logical commit must be re-published split by
//! visibility class, with each class living on its own reference.
//!
//! The new object graph is serialized to a packfile at a caller-chosen path so
//! the push pipeline can commit it like any other upload.

use std::path::PathBuf;

use futures::FutureExt;
use futures::future::BoxFuture;
use regex::RegexSet;

use crate::{
    config::RequestContext,
    errors::GitError,
    hash::ObjectId,
    internal::{
        object::{
            ObjectTrait,
            commit::Commit,
            signature::Signature,
            tree::Tree,
            types::ObjectType,
        },
        pack::{encode::PackEncoder, entry::Entry},
    },
    odb::ObjectDatabase,
    protocol::types::RefUpdate,
    tree_ops::{merge_trees, split_tree},
};

/// One bucket of the split: which paths it owns, which commit (if any) it
/// extends, and which reference it lands on.
pub struct SpliceDescription {
    pub path_filter: RegexSet,
    pub parent: Option<ObjectId>,
    pub reference_name: String,
}

impl SpliceDescription {
    pub fn new(
        patterns: &[&str],
        parent: Option<ObjectId>,
        reference_name: impl Into<String>,
    ) -> Result<Self, GitError> {
        let path_filter = RegexSet::new(patterns)
            .map_err(|e| GitError::bad_request(format!("bad path pattern: {e}")))?;
        Ok(Self {
            path_filter,
            parent,
            reference_name: reference_name.into(),
        })
    }

    fn matches(&self, path: &str) -> bool {
        self.path_filter.is_match(path)
    }
}

/// Inputs of one splice run.
pub struct SpliceOptions {
    /// The incoming commit, readable from the source database.
    pub commit: ObjectId,
    /// Optional first parent of the merge commit.
    pub parent: Option<ObjectId>,
    pub descriptions: Vec<SpliceDescription>,
    /// Reference the merge commit lands on.
    pub reference_name: String,
    pub author: Signature,
    pub committer: Signature,
    /// Appended to the original message after a blank line.
    pub message_trailer: Option<String>,
    /// Where to write the resulting packfile.
    pub pack_path: PathBuf,
}

/// Decompose `options.commit` per the descriptions, build the merge commit,
/// write the new object graph as a pack, and return the reference updates:
/// one per bucket plus one for the merge commit.
pub async fn splice_commit(
    src: &dyn ObjectDatabase,
    dst: &dyn ObjectDatabase,
    ctx: &RequestContext,
    options: &SpliceOptions,
) -> Result<Vec<RefUpdate>, GitError> {
    let commit = src.read_commit(options.commit).await?;

    // Assign every leaf path to the first description that matches it;
    // unmatched paths are dropped.
    let mut leaf_paths = Vec::new();
    collect_leaf_paths(src, ctx, commit.tree_id, String::new(), &mut leaf_paths).await?;
    let mut buckets: Vec<Vec<String>> = vec![Vec::new(); options.descriptions.len()];
    for path in leaf_paths {
        if let Some(index) = options
            .descriptions
            .iter()
            .position(|d| d.matches(&path))
        {
            buckets[index].push(path);
        }
    }

    let message = spliced_message(&commit, options.message_trailer.as_deref());

    let mut split_commit_ids = Vec::with_capacity(buckets.len());
    let mut split_tree_ids = Vec::with_capacity(buckets.len());
    let mut new_commits = Vec::new();
    for (description, paths) in options.descriptions.iter().zip(&buckets) {
        ctx.ensure_live()?;
        let subtree = if paths.is_empty() {
            let tree = Tree::empty();
            dst.write_object(ObjectType::Tree, &tree.to_data()?)
                .await?;
            tree
        } else {
            split_tree(commit.tree_id, src, paths, dst, ctx).await?
        };
        split_tree_ids.push(subtree.id);

        if let Some(parent_id) = description.parent {
            let parent = dst.read_commit(parent_id).await?;
            if parent.tree_id == subtree.id {
                // Nothing changed in this bucket: reuse the parent commit.
                split_commit_ids.push(parent_id);
                continue;
            }
        }

        let split_commit = Commit::new(
            options.author.clone(),
            options.committer.clone(),
            subtree.id,
            description.parent.into_iter().collect(),
            &message,
        );
        dst.write_object(
            ObjectType::Commit,
            &split_commit.to_data()?,
        )
        .await?;
        split_commit_ids.push(split_commit.id);
        new_commits.push(split_commit);
    }

    // Merge the bucket trees in description order; first bucket wins on
    // overlaps by construction.
    let merged_tree = merge_trees(dst, ctx, &split_tree_ids).await?;
    let mut merge_parents: Vec<ObjectId> = options.parent.into_iter().collect();
    merge_parents.extend(&split_commit_ids);
    let merge_commit = Commit::new(
        options.author.clone(),
        options.committer.clone(),
        merged_tree.id,
        merge_parents,
        &message,
    );
    dst.write_object(
        ObjectType::Commit,
        &merge_commit.to_data()?,
    )
    .await?;

    write_splice_pack(dst, ctx, &merge_commit, &new_commits, options).await?;

    let mut commands = Vec::with_capacity(split_commit_ids.len() + 1);
    for (description, new_id) in options.descriptions.iter().zip(&split_commit_ids) {
        let old = dst
            .resolve_reference(&description.reference_name)
            .await?
            .unwrap_or(ObjectId::ZERO);
        commands.push(RefUpdate::new(
            old,
            *new_id,
            description.reference_name.clone(),
        ));
    }
    let old = dst
        .resolve_reference(&options.reference_name)
        .await?
        .unwrap_or(ObjectId::ZERO);
    commands.push(RefUpdate::new(
        old,
        merge_commit.id,
        options.reference_name.clone(),
    ));
    Ok(commands)
}

/// Original message plus the optional trailer, separated by a blank line.
fn spliced_message(commit: &Commit, trailer: Option<&str>) -> String {
    match trailer {
        None => commit.message.clone(),
        Some(trailer) => {
            let mut message = commit.message.trim_end_matches('\n').to_string();
            message.push_str("\n\n");
            message.push_str(trailer);
            message.push('\n');
            message
        }
    }
}

fn collect_leaf_paths<'a>(
    src: &'a dyn ObjectDatabase,
    ctx: &'a RequestContext,
    tree_id: ObjectId,
    prefix: String,
    out: &'a mut Vec<String>,
) -> BoxFuture<'a, Result<(), GitError>> {
    async move {
        let tree = src.read_tree(tree_id).await?;
        for entry in &tree.entries {
            ctx.ensure_live()?;
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{prefix}/{}", entry.name)
            };
            if entry.mode.is_tree() {
                collect_leaf_paths(src, ctx, entry.id, path, out).await?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }
    .boxed()
}

/// Serialize every object the splice created to `options.pack_path`.
async fn write_splice_pack(
    dst: &dyn ObjectDatabase,
    ctx: &RequestContext,
    merge_commit: &Commit,
    split_commits: &[Commit],
    options: &SpliceOptions,
) -> Result<(), GitError> {
    let mut encoder = PackEncoder::new();
    encoder.insert(Entry::from(merge_commit.clone()));
    for commit in split_commits {
        encoder.insert(Entry::from(commit.clone()));
    }
    pack_tree(dst, ctx, merge_commit.tree_id, &mut encoder).await?;
    for commit in split_commits {
        pack_tree(dst, ctx, commit.tree_id, &mut encoder).await?;
    }
    let (bytes, _) = encoder.encode()?;
    tokio::fs::write(&options.pack_path, bytes).await?;
    Ok(())
}

fn pack_tree<'a>(
    odb: &'a dyn ObjectDatabase,
    ctx: &'a RequestContext,
    tree_id: ObjectId,
    encoder: &'a mut PackEncoder,
) -> BoxFuture<'a, Result<(), GitError>> {
    async move {
        if encoder.contains(&tree_id) {
            return Ok(());
        }
        let tree = odb.read_tree(tree_id).await?;
        encoder.insert(Entry::from(tree.clone()));
        for entry in &tree.entries {
            ctx.ensure_live()?;
            if entry.mode.is_tree() {
                pack_tree(odb, ctx, entry.id, encoder).await?;
            } else if !encoder.contains(&entry.id) {
                let blob = odb.read_blob(entry.id).await?;
                encoder.insert(Entry::from(blob));
            }
        }
        Ok(())
    }
    .boxed()
}
