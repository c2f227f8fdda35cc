//! Reference discovery and the `info/refs` advertisement.
//!
//! Both services advertise the same structure: an optional HEAD line carrying
//! the capability list behind a NUL, then every visible reference in name
//! order. Pulls additionally advertise `symref=HEAD:<target>`; pushes to a
//! repository with nothing visible emit the `capabilities^{}` placeholder so
//! the capability list still reaches the client.

use bytes::{Bytes, BytesMut};

use crate::{
    config::{AuthorizationLevel, ServerHooks},
    errors::GitError,
    hash::ObjectId,
    protocol::{
        pkt::{write_flush, write_pkt_line_string},
        types::{DiscoveryResult, NUL, ServiceType, pull_capabilities, push_capabilities},
    },
    repository::RepositoryHandle,
};

/// Compute the visible reference set for one viewer.
pub async fn discover_references(
    handle: &mut RepositoryHandle,
    hooks: &dyn ServerHooks,
    level: AuthorizationLevel,
) -> Result<DiscoveryResult, GitError> {
    let mut result = DiscoveryResult {
        head_symref: handle.odb().head_symref().await?,
        ..Default::default()
    };

    let refs = handle.references().await?;
    for (name, oid) in refs {
        if !level.can_see_reference(&name) || !hooks.reference_visible(level, &name) {
            continue;
        }
        result.references.insert(name, oid);
    }

    // HEAD is advertised with its resolved target, and only while the chain
    // ends at a visible reference.
    if let Some(target) = &result.head_symref {
        if let Some(oid) = result.references.get(target).copied() {
            result.references.insert("HEAD".to_string(), oid);
        }
    }

    Ok(result)
}

/// Render the smart-HTTP advertisement body for `info/refs`.
pub fn render_advertisement(
    result: &DiscoveryResult,
    service: ServiceType,
) -> Result<Bytes, GitError> {
    let mut buf = BytesMut::new();
    write_pkt_line_string(&mut buf, format!("# service={service}\n"))?;
    write_flush(&mut buf);

    let capabilities = match service {
        ServiceType::UploadPack => match &result.head_symref {
            Some(target) if result.references.contains_key("HEAD") => {
                format!("{} symref=HEAD:{target}", pull_capabilities())
            }
            _ => pull_capabilities(),
        },
        ServiceType::ReceivePack => push_capabilities(),
    };

    let mut first = true;
    if let Some(head) = result.references.get("HEAD") {
        write_pkt_line_string(&mut buf, format!("{head} HEAD{NUL}{capabilities}\n"))?;
        first = false;
    }
    for (name, oid) in &result.references {
        if name == "HEAD" {
            continue;
        }
        if first {
            write_pkt_line_string(&mut buf, format!("{oid} {name}{NUL}{capabilities}\n"))?;
            first = false;
        } else {
            write_pkt_line_string(&mut buf, format!("{oid} {name}\n"))?;
        }
    }

    if first && service == ServiceType::ReceivePack {
        write_pkt_line_string(
            &mut buf,
            format!("{} capabilities^{{}}{NUL}{capabilities}\n", ObjectId::ZERO),
        )?;
    }

    write_flush(&mut buf);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{DefaultHooks, RESTRICTED_REF};
    use crate::lockfile::LockfileManager;
    use crate::odb::MemoryOdb;
    use crate::protocol::pkt::{PktLine, read_pkt_line};
    use crate::repository::{RepositoryCache, RepositoryOpener, StaticOpener};

    fn advert_lines(bytes: &Bytes) -> Vec<String> {
        let mut rest = bytes.clone();
        let mut lines = Vec::new();
        loop {
            match read_pkt_line(&mut rest).unwrap() {
                PktLine::Data(data) => {
                    lines.push(String::from_utf8_lossy(&data).trim_end().to_string())
                }
                PktLine::Flush => lines.push("<flush>".to_string()),
                PktLine::Eof => break,
            }
        }
        lines
    }

    async fn handle_for(odb: MemoryOdb) -> (tempfile::TempDir, RepositoryCache, RepositoryHandle) {
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

    fn seeded_odb() -> (MemoryOdb, ObjectId, ObjectId) {
        let odb = MemoryOdb::new();
        let master = ObjectId::hash_bytes(b"master-tip");
        let meta = ObjectId::hash_bytes(b"meta-tip");
        odb.force_reference("refs/heads/master", master);
        odb.force_reference(RESTRICTED_REF, meta);
        odb.set_head_symref("refs/heads/master");
        (odb, master, meta)
    }

    #[tokio::test]
    async fn test_pull_advertisement_full_access() {
        let (odb, master, meta) = seeded_odb();
        let (_dir, cache, mut handle) = handle_for(odb).await;
        let result = discover_references(&mut handle, &DefaultHooks, AuthorizationLevel::Full)
            .await
            .unwrap();
        let lines = advert_lines(
            &render_advertisement(&result, ServiceType::UploadPack).unwrap(),
        );

        assert_eq!(lines[0], "# service=git-upload-pack");
        assert_eq!(lines[1], "<flush>");
        let head_line = &lines[2];
        assert!(head_line.starts_with(&format!("{master} HEAD\0")));
        assert!(head_line.contains("allow-tip-sha1-in-want"));
        assert!(head_line.contains("shallow"));
        assert!(head_line.contains("thin-pack"));
        assert!(head_line.ends_with("symref=HEAD:refs/heads/master"));
        assert_eq!(lines[3], format!("{master} refs/heads/master"));
        assert_eq!(lines[4], format!("{meta} {RESTRICTED_REF}"));
        assert_eq!(lines[5], "<flush>");

        cache.release(handle).unwrap();
    }

    #[tokio::test]
    async fn test_restricted_viewer_does_not_see_meta_config() {
        let (odb, master, _meta) = seeded_odb();
        let (_dir, cache, mut handle) = handle_for(odb).await;
        let result =
            discover_references(&mut handle, &DefaultHooks, AuthorizationLevel::Restricted)
                .await
                .unwrap();
        let lines = advert_lines(
            &render_advertisement(&result, ServiceType::UploadPack).unwrap(),
        );
        assert!(lines.iter().all(|l| !l.contains(RESTRICTED_REF)));
        assert!(lines.iter().any(|l| l.starts_with(&format!("{master} HEAD"))));
        cache.release(handle).unwrap();
    }

    #[tokio::test]
    async fn test_discovery_callback_filters_refs() {
        struct HideMaster;
        #[async_trait::async_trait]
        impl ServerHooks for HideMaster {
            fn reference_visible(&self, _level: AuthorizationLevel, name: &str) -> bool {
                name != "refs/heads/master"
            }
        }

        let (odb, _master, _meta) = seeded_odb();
        let (_dir, cache, mut handle) = handle_for(odb).await;
        let result = discover_references(&mut handle, &HideMaster, AuthorizationLevel::Full)
            .await
            .unwrap();
        // HEAD's target is hidden, so HEAD is not advertised either.
        assert!(!result.references.contains_key("HEAD"));
        assert!(!result.references.contains_key("refs/heads/master"));
        assert!(result.references.contains_key(RESTRICTED_REF));
        cache.release(handle).unwrap();
    }

    #[tokio::test]
    async fn test_push_advertisement_empty_repo_synthetic_line() {
        let odb = MemoryOdb::new();
        odb.set_head_symref("refs/heads/master");
        let (_dir, cache, mut handle) = handle_for(odb).await;
        let result = discover_references(&mut handle, &DefaultHooks, AuthorizationLevel::Full)
            .await
            .unwrap();
        let lines = advert_lines(
            &render_advertisement(&result, ServiceType::ReceivePack).unwrap(),
        );
        assert_eq!(lines[0], "# service=git-receive-pack");
        let synthetic = &lines[2];
        assert!(synthetic.starts_with(&format!("{} capabilities^{{}}\0", ObjectId::ZERO)));
        assert!(synthetic.contains("report-status"));
        assert!(synthetic.contains("atomic"));
        assert!(!synthetic.contains("symref"));
        cache.release(handle).unwrap();
    }

    #[tokio::test]
    async fn test_push_advertisement_has_no_symref() {
        let (odb, _master, _meta) = seeded_odb();
        let (_dir, cache, mut handle) = handle_for(odb).await;
        let result = discover_references(&mut handle, &DefaultHooks, AuthorizationLevel::Full)
            .await
            .unwrap();
        let lines = advert_lines(
            &render_advertisement(&result, ServiceType::ReceivePack).unwrap(),
        );
        assert!(lines.iter().all(|l| !l.contains("symref")));
        cache.release(handle).unwrap();
    }
}
