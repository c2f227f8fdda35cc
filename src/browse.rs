//! Read-only JSON browsing API.
//!
//! Thin readers over the same object database the smart protocol serves:
//! a ref listing, a first-parent commit log with a pagination cursor, commit
//! and tree and blob rendering, and zip/tar.gz archive streams. All of it sits
//! behind the same authorization levels as the pull path.

use std::io::Write;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use serde_json::{Map, Value, json};

use crate::{
    config::{AuthorizationLevel, RequestContext, ServerHooks},
    errors::GitError,
    hash::ObjectId,
    internal::object::{commit::Commit, tree::Tree},
    odb::ObjectDatabase,
    repository::RepositoryHandle,
};

/// Commits per log page.
pub const LOG_PAGE_SIZE: usize = 100;

/// Blob payloads at or above this size are omitted from JSON rendering.
pub const MAX_INLINE_BLOB: u64 = 1 << 20;

/// Trailer carrying the archive's uncompressed byte count.
pub const UNCOMPRESSED_SIZE_TRAILER: &str = "Omegaup-Uncompressed-Size";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

/// One parsed `/+…` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseRoute {
    Refs,
    Log { rev: String },
    Archive { rev: String, format: ArchiveFormat },
    Show { rev: String, path: String },
}

impl BrowseRoute {
    /// Parse the path segments after the repository name.
    pub fn parse(segments: &[&str]) -> Result<Self, GitError> {
        match segments {
            ["+refs"] => Ok(BrowseRoute::Refs),
            ["+log"] => Ok(BrowseRoute::Log {
                rev: "HEAD".to_string(),
            }),
            ["+log", rest @ ..] if !rest.is_empty() => Ok(BrowseRoute::Log {
                rev: rest.join("/"),
            }),
            ["+archive", file] => {
                if let Some(rev) = file.strip_suffix(".zip") {
                    Ok(BrowseRoute::Archive {
                        rev: rev.to_string(),
                        format: ArchiveFormat::Zip,
                    })
                } else if let Some(rev) = file.strip_suffix(".tar.gz") {
                    Ok(BrowseRoute::Archive {
                        rev: rev.to_string(),
                        format: ArchiveFormat::TarGz,
                    })
                } else {
                    Err(GitError::NotAcceptable(format!(
                        "unsupported archive `{file}`"
                    )))
                }
            }
            ["+", rev, path @ ..] => Ok(BrowseRoute::Show {
                rev: rev.to_string(),
                path: path.join("/"),
            }),
            _ => Err(GitError::not_found(segments.join("/"))),
        }
    }
}

pub struct Rendered {
    pub content_type: &'static str,
    pub body: Bytes,
    pub trailers: Vec<(String, String)>,
}

impl Rendered {
    fn json(value: &Value) -> Result<Self, GitError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| GitError::Internal(format!("json rendering: {e}")))?;
        Ok(Self {
            content_type: "application/json",
            body: Bytes::from(body),
            trailers: Vec::new(),
        })
    }
}

/// Render one browse route.
pub async fn render(
    handle: &mut RepositoryHandle,
    ctx: &RequestContext,
    hooks: &dyn ServerHooks,
    level: AuthorizationLevel,
    route: BrowseRoute,
    accept_octet_stream: bool,
) -> Result<Rendered, GitError> {
    match route {
        BrowseRoute::Refs => render_refs(handle, hooks, level).await,
        BrowseRoute::Log { rev } => {
            let commit_id = resolve_rev(handle, hooks, level, &rev).await?;
            render_log(handle.odb(), ctx, commit_id).await
        }
        BrowseRoute::Archive { rev, format } => {
            let commit_id = resolve_rev(handle, hooks, level, &rev).await?;
            render_archive(handle.odb(), ctx, commit_id, format).await
        }
        BrowseRoute::Show { rev, path } => {
            let commit_id = resolve_rev(handle, hooks, level, &rev).await?;
            render_show(handle.odb(), ctx, commit_id, &path, accept_octet_stream).await
        }
    }
}

async fn render_refs(
    handle: &mut RepositoryHandle,
    hooks: &dyn ServerHooks,
    level: AuthorizationLevel,
) -> Result<Rendered, GitError> {
    let mut out = Map::new();
    if let Some(target) = handle.odb().head_symref().await? {
        out.insert("HEAD".to_string(), json!({ "target": target }));
    }
    for (name, oid) in handle.references().await? {
        if !level.can_see_reference(&name) || !hooks.reference_visible(level, &name) {
            continue;
        }
        out.insert(name, Value::String(oid.to_string()));
    }
    Rendered::json(&Value::Object(out))
}

/// Resolve a revision string: a full object id, a reference name, a branch
/// short name, or `HEAD`.
async fn resolve_rev(
    handle: &mut RepositoryHandle,
    hooks: &dyn ServerHooks,
    level: AuthorizationLevel,
    rev: &str,
) -> Result<ObjectId, GitError> {
    if let Ok(oid) = ObjectId::from_str(rev) {
        if handle.odb().commit_exists(oid).await? {
            return Ok(oid);
        }
        return Err(GitError::not_found(rev.to_string()));
    }

    let candidates = [rev.to_string(), format!("refs/heads/{rev}")];
    for name in candidates {
        if name != "HEAD"
            && (!level.can_see_reference(&name) || !hooks.reference_visible(level, &name))
        {
            continue;
        }
        if let Some(oid) = handle.odb().resolve_reference(&name).await? {
            return Ok(oid);
        }
    }
    Err(GitError::not_found(rev.to_string()))
}

fn signature_json(sig: &crate::internal::object::signature::Signature) -> Value {
    json!({
        "name": sig.name,
        "email": sig.email,
        "time": sig.time_rfc1123z(),
    })
}

fn commit_json(commit: &Commit) -> Value {
    json!({
        "commit": commit.id.to_string(),
        "tree": commit.tree_id.to_string(),
        "parents": commit
            .parent_ids
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>(),
        "author": signature_json(&commit.author),
        "committer": signature_json(&commit.committer),
        "message": commit.message,
    })
}

async fn render_log(
    odb: &dyn ObjectDatabase,
    ctx: &RequestContext,
    start: ObjectId,
) -> Result<Rendered, GitError> {
    let mut log = Vec::new();
    let mut cursor = Some(start);
    while let Some(oid) = cursor {
        ctx.ensure_live()?;
        if log.len() == LOG_PAGE_SIZE {
            return Rendered::json(&json!({ "log": log, "next": oid.to_string() }));
        }
        let commit = odb.read_commit(oid).await?;
        log.push(commit_json(&commit));
        cursor = commit.first_parent();
    }
    Rendered::json(&json!({ "log": log }))
}

async fn render_show(
    odb: &dyn ObjectDatabase,
    ctx: &RequestContext,
    commit_id: ObjectId,
    path: &str,
    accept_octet_stream: bool,
) -> Result<Rendered, GitError> {
    let commit = odb.read_commit(commit_id).await?;
    if path.is_empty() {
        return Rendered::json(&commit_json(&commit));
    }

    // Walk the path one component at a time.
    let mut tree = odb.read_tree(commit.tree_id).await?;
    let components: Vec<&str> = path.split('/').collect();
    for (i, component) in components.iter().enumerate() {
        ctx.ensure_live()?;
        let entry = tree
            .entry(component)
            .ok_or_else(|| GitError::not_found(path.to_string()))?
            .clone();
        let last = i + 1 == components.len();
        if entry.mode.is_tree() {
            tree = odb.read_tree(entry.id).await?;
            if last {
                return tree_json(odb, &tree).await;
            }
        } else {
            if !last {
                return Err(GitError::not_found(path.to_string()));
            }
            return blob_response(odb, entry.id, accept_octet_stream).await;
        }
    }
    unreachable!("loop returns on the last component")
}

async fn tree_json(odb: &dyn ObjectDatabase, tree: &Tree) -> Result<Rendered, GitError> {
    let mut entries = Vec::with_capacity(tree.entries.len());
    for entry in &tree.entries {
        let (size, kind) = if entry.mode.is_tree() {
            (0, "tree")
        } else {
            let (size, _) = odb.object_header(entry.id).await?;
            (size, "blob")
        };
        entries.push(json!({
            "mode": entry.mode.as_decimal(),
            "type": kind,
            "id": entry.id.to_string(),
            "name": entry.name,
            "size": size,
        }));
    }
    Rendered::json(&json!({ "id": tree.id.to_string(), "entries": entries }))
}

async fn blob_response(
    odb: &dyn ObjectDatabase,
    id: ObjectId,
    accept_octet_stream: bool,
) -> Result<Rendered, GitError> {
    let blob = odb.read_blob(id).await?;
    if accept_octet_stream {
        return Ok(Rendered {
            content_type: "application/octet-stream",
            body: Bytes::from(blob.data),
            trailers: Vec::new(),
        });
    }
    let size = blob.data.len() as u64;
    let mut out = Map::new();
    out.insert("id".to_string(), Value::String(blob.id.to_string()));
    out.insert("size".to_string(), json!(size));
    if size < MAX_INLINE_BLOB {
        out.insert(
            "contents".to_string(),
            Value::String(BASE64.encode(&blob.data)),
        );
    }
    Rendered::json(&Value::Object(out))
}

/// One file of an archive.
struct ArchiveEntry {
    path: String,
    mode: u32,
    data: Vec<u8>,
}

async fn render_archive(
    odb: &dyn ObjectDatabase,
    ctx: &RequestContext,
    commit_id: ObjectId,
    format: ArchiveFormat,
) -> Result<Rendered, GitError> {
    let commit = odb.read_commit(commit_id).await?;
    let mut entries = Vec::new();
    collect_archive_entries(odb, ctx, commit.tree_id, String::new(), &mut entries).await?;
    let uncompressed: u64 = entries.iter().map(|e| e.data.len() as u64).sum();
    let mtime = commit.committer.timestamp.max(0) as u64;

    let (content_type, body) = match format {
        ArchiveFormat::Zip => ("application/zip", build_zip(&entries)?),
        ArchiveFormat::TarGz => ("application/gzip", build_tar_gz(&entries, mtime)?),
    };
    Ok(Rendered {
        content_type,
        body: Bytes::from(body),
        trailers: vec![(
            UNCOMPRESSED_SIZE_TRAILER.to_string(),
            uncompressed.to_string(),
        )],
    })
}

fn collect_archive_entries<'a>(
    odb: &'a dyn ObjectDatabase,
    ctx: &'a RequestContext,
    tree_id: ObjectId,
    prefix: String,
    out: &'a mut Vec<ArchiveEntry>,
) -> futures::future::BoxFuture<'a, Result<(), GitError>> {
    use futures::FutureExt;
    async move {
        let tree = odb.read_tree(tree_id).await?;
        for entry in &tree.entries {
            ctx.ensure_live()?;
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{prefix}/{}", entry.name)
            };
            if entry.mode.is_tree() {
                collect_archive_entries(odb, ctx, entry.id, path, out).await?;
            } else {
                let blob = odb.read_blob(entry.id).await?;
                out.push(ArchiveEntry {
                    path,
                    mode: entry.mode.as_decimal() & 0o777,
                    data: blob.data,
                });
            }
        }
        Ok(())
    }
    .boxed()
}

fn build_zip(entries: &[ArchiveEntry]) -> Result<Vec<u8>, GitError> {
    let cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(cursor);
    for entry in entries {
        let options: zip::write::SimpleFileOptions = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(entry.mode);
        writer
            .start_file(entry.path.as_str(), options)
            .map_err(|e| GitError::Internal(format!("zip: {e}")))?;
        writer.write_all(&entry.data)?;
    }
    let cursor = writer
        .finish()
        .map_err(|e| GitError::Internal(format!("zip: {e}")))?;
    Ok(cursor.into_inner())
}

fn build_tar_gz(entries: &[ArchiveEntry], mtime: u64) -> Result<Vec<u8>, GitError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(entry.data.len() as u64);
        header.set_mode(entry.mode);
        header.set_mtime(mtime);
        header.set_cksum();
        builder.append_data(&mut header, &entry.path, entry.data.as_slice())?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{DefaultHooks, RESTRICTED_REF};
    use crate::internal::object::{
        blob::Blob,
        signature::{Signature, SignatureType},
        tree::{TreeEntry, TreeEntryMode},
    };
    use crate::lockfile::LockfileManager;
    use crate::odb::MemoryOdb;
    use crate::repository::{RepositoryCache, RepositoryOpener, StaticOpener};

    fn sig(kind: SignatureType) -> Signature {
        Signature::new(
            kind,
            "reader".to_string(),
            "reader@example.com".to_string(),
            1503543845,
            "+0000".to_string(),
        )
    }

    fn seed(odb: &MemoryOdb) -> Commit {
        let blob = Blob::from_content("fn main() {}\n");
        odb.put_blob(blob.clone());
        let src = Tree::from_entries(vec![TreeEntry::new(
            TreeEntryMode::Blob,
            blob.id,
            "main.rs".to_string(),
        )])
        .unwrap();
        odb.put_tree(src.clone());
        let root = Tree::from_entries(vec![TreeEntry::new(
            TreeEntryMode::Tree,
            src.id,
            "src".to_string(),
        )])
        .unwrap();
        odb.put_tree(root.clone());
        let commit = Commit::new(
            sig(SignatureType::Author),
            sig(SignatureType::Committer),
            root.id,
            vec![],
            "\ninitial import\n",
        );
        odb.put_commit(commit.clone());
        odb.force_reference("refs/heads/master", commit.id);
        odb.set_head_symref("refs/heads/master");
        commit
    }

    async fn open(odb: MemoryOdb) -> (tempfile::TempDir, RepositoryCache, RepositoryHandle) {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(StaticOpener::new());
        opener.register(dir.path(), Arc::new(odb));
        let cache = RepositoryCache::new(
            opener as Arc<dyn RepositoryOpener>,
            Arc::new(LockfileManager::new()),
        );
        let handle = cache.open(dir.path()).await.unwrap();
        (dir, cache, handle)
    }

    fn parse(rendered: &Rendered) -> Value {
        serde_json::from_slice(&rendered.body).unwrap()
    }

    #[test]
    fn test_route_parsing() {
        assert_eq!(BrowseRoute::parse(&["+refs"]).unwrap(), BrowseRoute::Refs);
        assert_eq!(
            BrowseRoute::parse(&["+log"]).unwrap(),
            BrowseRoute::Log { rev: "HEAD".to_string() }
        );
        assert_eq!(
            BrowseRoute::parse(&["+archive", "abc.tar.gz"]).unwrap(),
            BrowseRoute::Archive {
                rev: "abc".to_string(),
                format: ArchiveFormat::TarGz
            }
        );
        assert_eq!(
            BrowseRoute::parse(&["+", "HEAD", "src", "main.rs"]).unwrap(),
            BrowseRoute::Show {
                rev: "HEAD".to_string(),
                path: "src/main.rs".to_string()
            }
        );
        assert!(matches!(
            BrowseRoute::parse(&["+archive", "abc.rar"]),
            Err(GitError::NotAcceptable(_))
        ));
    }

    #[tokio::test]
    async fn test_refs_listing_includes_head_target() {
        let odb = MemoryOdb::new();
        let commit = seed(&odb);
        let (_dir, cache, mut handle) = open(odb).await;
        let rendered = render(
            &mut handle,
            &RequestContext::new(),
            &DefaultHooks,
            AuthorizationLevel::Full,
            BrowseRoute::Refs,
            false,
        )
        .await
        .unwrap();
        let value = parse(&rendered);
        assert_eq!(value["HEAD"]["target"], "refs/heads/master");
        assert_eq!(value["refs/heads/master"], commit.id.to_string());
        cache.release(handle).unwrap();
    }

    #[tokio::test]
    async fn test_restricted_refs_hidden_from_listing_and_resolution() {
        let odb = MemoryOdb::new();
        let commit = seed(&odb);
        odb.force_reference(RESTRICTED_REF, commit.id);
        let (_dir, cache, mut handle) = open(odb).await;

        let rendered = render(
            &mut handle,
            &RequestContext::new(),
            &DefaultHooks,
            AuthorizationLevel::Restricted,
            BrowseRoute::Refs,
            false,
        )
        .await
        .unwrap();
        assert!(parse(&rendered).get(RESTRICTED_REF).is_none());

        let result = render(
            &mut handle,
            &RequestContext::new(),
            &DefaultHooks,
            AuthorizationLevel::Restricted,
            BrowseRoute::Log {
                rev: RESTRICTED_REF.to_string(),
            },
            false,
        )
        .await;
        assert!(matches!(result, Err(GitError::NotFound(_))));
        cache.release(handle).unwrap();
    }

    #[tokio::test]
    async fn test_commit_json_shape() {
        let odb = MemoryOdb::new();
        let commit = seed(&odb);
        let (_dir, cache, mut handle) = open(odb).await;
        let rendered = render(
            &mut handle,
            &RequestContext::new(),
            &DefaultHooks,
            AuthorizationLevel::ReadOnly,
            BrowseRoute::Show {
                rev: commit.id.to_string(),
                path: String::new(),
            },
            false,
        )
        .await
        .unwrap();
        let value = parse(&rendered);
        assert_eq!(value["commit"], commit.id.to_string());
        assert_eq!(value["tree"], commit.tree_id.to_string());
        assert_eq!(value["parents"].as_array().unwrap().len(), 0);
        assert_eq!(value["author"]["name"], "reader");
        assert_eq!(value["author"]["time"], "Thu, 24 Aug 2017 02:24:05 +0000");
        cache.release(handle).unwrap();
    }

    #[tokio::test]
    async fn test_tree_and_blob_rendering() {
        let odb = MemoryOdb::new();
        let _commit = seed(&odb);
        let (_dir, cache, mut handle) = open(odb).await;

        let rendered = render(
            &mut handle,
            &RequestContext::new(),
            &DefaultHooks,
            AuthorizationLevel::Full,
            BrowseRoute::Show {
                rev: "master".to_string(),
                path: "src".to_string(),
            },
            false,
        )
        .await
        .unwrap();
        let value = parse(&rendered);
        let entry = &value["entries"][0];
        assert_eq!(entry["name"], "main.rs");
        assert_eq!(entry["type"], "blob");
        assert_eq!(entry["mode"], 33188);
        assert_eq!(entry["size"], 13);

        let rendered = render(
            &mut handle,
            &RequestContext::new(),
            &DefaultHooks,
            AuthorizationLevel::Full,
            BrowseRoute::Show {
                rev: "master".to_string(),
                path: "src/main.rs".to_string(),
            },
            false,
        )
        .await
        .unwrap();
        let value = parse(&rendered);
        assert_eq!(value["size"], 13);
        let decoded = BASE64
            .decode(value["contents"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"fn main() {}\n");

        // Raw bytes when the client asks for octet-stream.
        let rendered = render(
            &mut handle,
            &RequestContext::new(),
            &DefaultHooks,
            AuthorizationLevel::Full,
            BrowseRoute::Show {
                rev: "master".to_string(),
                path: "src/main.rs".to_string(),
            },
            true,
        )
        .await
        .unwrap();
        assert_eq!(rendered.content_type, "application/octet-stream");
        assert_eq!(&rendered.body[..], b"fn main() {}\n");
        cache.release(handle).unwrap();
    }

    #[tokio::test]
    async fn test_log_pagination() {
        let odb = MemoryOdb::new();
        // A chain longer than one page.
        let mut parent: Option<ObjectId> = None;
        let tree = Tree::empty();
        odb.put_tree(tree.clone());
        let mut tip = ObjectId::ZERO;
        for i in 0..LOG_PAGE_SIZE + 5 {
            let commit = Commit::new(
                sig(SignatureType::Author),
                sig(SignatureType::Committer),
                tree.id,
                parent.into_iter().collect(),
                &format!("\ncommit {i}\n"),
            );
            odb.put_commit(commit.clone());
            parent = Some(commit.id);
            tip = commit.id;
        }
        odb.force_reference("refs/heads/master", tip);
        odb.set_head_symref("refs/heads/master");
        let (_dir, cache, mut handle) = open(odb).await;

        let rendered = render(
            &mut handle,
            &RequestContext::new(),
            &DefaultHooks,
            AuthorizationLevel::Full,
            BrowseRoute::Log {
                rev: "HEAD".to_string(),
            },
            false,
        )
        .await
        .unwrap();
        let value = parse(&rendered);
        assert_eq!(value["log"].as_array().unwrap().len(), LOG_PAGE_SIZE);
        let next = value["next"].as_str().unwrap().to_string();

        // The cursor continues the walk.
        let rendered = render(
            &mut handle,
            &RequestContext::new(),
            &DefaultHooks,
            AuthorizationLevel::Full,
            BrowseRoute::Log { rev: next },
            false,
        )
        .await
        .unwrap();
        let value = parse(&rendered);
        assert_eq!(value["log"].as_array().unwrap().len(), 5);
        assert!(value.get("next").is_none());
        cache.release(handle).unwrap();
    }

    #[tokio::test]
    async fn test_archives_round_trip() {
        let odb = MemoryOdb::new();
        let _commit = seed(&odb);
        let (_dir, cache, mut handle) = open(odb).await;

        let rendered = render(
            &mut handle,
            &RequestContext::new(),
            &DefaultHooks,
            AuthorizationLevel::Full,
            BrowseRoute::Archive {
                rev: "master".to_string(),
                format: ArchiveFormat::TarGz,
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(rendered.content_type, "application/gzip");
        assert_eq!(
            rendered.trailers,
            vec![(UNCOMPRESSED_SIZE_TRAILER.to_string(), "13".to_string())]
        );
        // Unpack and verify the single file.
        let decoder = flate2::read::GzDecoder::new(&rendered.body[..]);
        let mut archive = tar::Archive::new(decoder);
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["src/main.rs"]);

        let rendered = render(
            &mut handle,
            &RequestContext::new(),
            &DefaultHooks,
            AuthorizationLevel::Full,
            BrowseRoute::Archive {
                rev: "master".to_string(),
                format: ArchiveFormat::Zip,
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(rendered.content_type, "application/zip");
        let reader = std::io::Cursor::new(rendered.body.to_vec());
        let mut archive = zip::ZipArchive::new(reader).unwrap();
        assert_eq!(archive.len(), 1);
        let file = archive.by_index(0).unwrap();
        assert_eq!(file.name(), "src/main.rs");
        cache.release(handle).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_rev_and_path_are_not_found() {
        let odb = MemoryOdb::new();
        seed(&odb);
        let (_dir, cache, mut handle) = open(odb).await;
        assert!(matches!(
            render(
                &mut handle,
                &RequestContext::new(),
                &DefaultHooks,
                AuthorizationLevel::Full,
                BrowseRoute::Log { rev: "does-not-exist".to_string() },
                false,
            )
            .await,
            Err(GitError::NotFound(_))
        ));
        assert!(matches!(
            render(
                &mut handle,
                &RequestContext::new(),
                &DefaultHooks,
                AuthorizationLevel::Full,
                BrowseRoute::Show {
                    rev: "master".to_string(),
                    path: "src/missing.rs".to_string()
                },
                false,
            )
            .await,
            Err(GitError::NotFound(_))
        ));
        cache.release(handle).unwrap();
    }
}
