//! Pull negotiation (`git-upload-pack`).
//!
//! The request body is a pkt-line state machine: a want/shallow/deepen phase
//! ended by a flush, an optional have phase ended by `done`, then the server
//! streams ACK/NAK and the packfile. Shallow boundaries are answered between
//! the two phases. A missing `done` means the client will come back; the
//! server just closes cleanly.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    config::RequestContext,
    errors::GitError,
    hash::ObjectId,
    internal::pack::{encode::PackEncoder, entry::Entry},
    odb::ObjectDatabase,
    protocol::{
        pkt::{PktLine, read_pkt_line, write_flush, write_pkt_line_string},
        types::Capability,
    },
};

/// Negotiated request state after the want phase.
#[derive(Debug, Default)]
struct Negotiation {
    wants: Vec<ObjectId>,
    /// Shallow boundaries the client already has.
    client_shallow: HashSet<ObjectId>,
    /// First-parent depth limit; `None` means unlimited.
    deepen: Option<usize>,
    capabilities: Vec<Capability>,
}

/// Everything upload-pack sends back: the record-oriented head (shallow
/// section, ACK/NAK or ERR) and, when negotiation completed, the pack stream.
pub struct UploadPackResponse {
    pub head: Bytes,
    pub pack: Option<ReceiverStream<Vec<u8>>>,
}

impl UploadPackResponse {
    fn head_only(head: Bytes) -> Self {
        Self { head, pack: None }
    }
}

/// Run the upload-pack state machine over a complete request body.
pub async fn upload_pack(
    odb: Arc<dyn ObjectDatabase>,
    ctx: &RequestContext,
    request: Bytes,
) -> Result<UploadPackResponse, GitError> {
    let mut request = request;
    let mut head = BytesMut::new();

    let negotiation = match parse_want_phase(&mut request)? {
        Some(negotiation) => negotiation,
        // EOF before the first flush: client went away, close cleanly.
        None => return Ok(UploadPackResponse::head_only(Bytes::new())),
    };
    if negotiation.wants.is_empty() {
        return Ok(UploadPackResponse::head_only(Bytes::new()));
    }

    // A want for something we do not have is answered in-band, not with an
    // HTTP failure.
    for want in &negotiation.wants {
        if !odb.commit_exists(*want).await? {
            let mut err = BytesMut::new();
            write_pkt_line_string(&mut err, format!("ERR upload-pack: not our ref {want}\n"))?;
            return Ok(UploadPackResponse::head_only(err.freeze()));
        }
    }

    // Shallow section: only present when the client asked to deepen.
    if let Some(depth) = negotiation.deepen {
        let boundaries = shallow_boundaries(odb.as_ref(), ctx, &negotiation.wants, depth).await?;
        for oid in &boundaries {
            if !negotiation.client_shallow.contains(oid) {
                write_pkt_line_string(&mut head, format!("shallow {oid}\n"))?;
            }
        }
        for oid in &negotiation.client_shallow {
            if !boundaries.contains(oid) {
                write_pkt_line_string(&mut head, format!("unshallow {oid}\n"))?;
            }
        }
        write_flush(&mut head);
    }

    // Have phase.
    let mut common = HashSet::new();
    let mut acked = false;
    let mut done = false;
    loop {
        match read_pkt_line(&mut request)? {
            PktLine::Eof => break,
            PktLine::Flush => continue,
            PktLine::Data(line) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches('\n');
                if text == "done" {
                    done = true;
                    break;
                }
                if let Some(rest) = text.strip_prefix("have ") {
                    let oid = ObjectId::from_str(rest.trim())
                        .map_err(|_| GitError::bad_request(format!("bad have line `{text}`")))?;
                    if odb.contains(oid).await? {
                        common.insert(oid);
                        if !acked {
                            write_pkt_line_string(&mut head, format!("ACK {oid}\n"))?;
                            acked = true;
                        }
                    }
                } else {
                    return Err(GitError::bad_request(format!(
                        "unexpected pkt-line in have phase: `{text}`"
                    )));
                }
            }
        }
    }

    if !done {
        // The client will retry with a refined have set.
        return Ok(UploadPackResponse::head_only(head.freeze()));
    }
    if !acked {
        write_pkt_line_string(&mut head, "NAK\n")?;
    }

    let pack = stream_pack(odb, ctx.clone(), negotiation, common).await?;
    Ok(UploadPackResponse {
        head: head.freeze(),
        pack: Some(pack),
    })
}

/// Parse want/shallow/deepen records until the flush. `None` means the stream
/// ended before the phase did.
fn parse_want_phase(request: &mut Bytes) -> Result<Option<Negotiation>, GitError> {
    let mut negotiation = Negotiation::default();
    let mut first_want = true;
    loop {
        match read_pkt_line(request)? {
            PktLine::Eof => return Ok(None),
            PktLine::Flush => return Ok(Some(negotiation)),
            PktLine::Data(line) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches('\n');
                let (command, rest) = text.split_once(' ').unwrap_or((text, ""));
                match command {
                    "want" => {
                        let mut fields = rest.split_ascii_whitespace();
                        let oid = fields
                            .next()
                            .and_then(|h| ObjectId::from_str(h).ok())
                            .ok_or_else(|| {
                                GitError::bad_request(format!("bad want line `{text}`"))
                            })?;
                        negotiation.wants.push(oid);
                        if first_want {
                            for token in fields {
                                match Capability::from_str(token) {
                                    Ok(Capability::Unknown(token)) => {
                                        return Err(GitError::bad_request(format!(
                                            "unknown capability `{token}`"
                                        )));
                                    }
                                    Ok(capability) => negotiation.capabilities.push(capability),
                                    Err(_) => unreachable!("capability parsing is total"),
                                }
                            }
                            first_want = false;
                        }
                    }
                    "shallow" => {
                        let oid = ObjectId::from_str(rest.trim()).map_err(|_| {
                            GitError::bad_request(format!("bad shallow line `{text}`"))
                        })?;
                        negotiation.client_shallow.insert(oid);
                    }
                    "deepen" => {
                        let depth: usize = rest.trim().parse().map_err(|_| {
                            GitError::bad_request(format!("bad deepen line `{text}`"))
                        })?;
                        if depth == 0 {
                            return Err(GitError::bad_request("deepen 0 is not a clone"));
                        }
                        negotiation.deepen = Some(depth);
                    }
                    _ => {
                        return Err(GitError::bad_request(format!(
                            "unexpected pkt-line in want phase: `{text}`"
                        )));
                    }
                }
            }
        }
    }
}

/// First-parent boundary commits for a depth-limited clone: the commit at the
/// cutoff depth, when it still has a parent behind it.
async fn shallow_boundaries(
    odb: &dyn ObjectDatabase,
    ctx: &RequestContext,
    wants: &[ObjectId],
    depth: usize,
) -> Result<HashSet<ObjectId>, GitError> {
    let mut boundaries = HashSet::new();
    for want in wants {
        let mut current = *want;
        for step in 1..=depth {
            ctx.ensure_live()?;
            let commit = odb.read_commit(current).await?;
            match commit.first_parent() {
                Some(parent) => {
                    if step == depth {
                        boundaries.insert(current);
                    } else {
                        current = parent;
                    }
                }
                None => break,
            }
        }
    }
    Ok(boundaries)
}

/// Spawn the pack builder; bytes flow through the channel as commits are
/// visited, so the pack never materializes server-side.
async fn stream_pack(
    odb: Arc<dyn ObjectDatabase>,
    ctx: RequestContext,
    negotiation: Negotiation,
    common: HashSet<ObjectId>,
) -> Result<ReceiverStream<Vec<u8>>, GitError> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        if let Err(e) = build_pack(odb.as_ref(), &ctx, &negotiation, &common, tx).await {
            tracing::warn!(error = %e, "pack build aborted");
        }
    });
    Ok(ReceiverStream::new(rx))
}

async fn build_pack(
    odb: &dyn ObjectDatabase,
    ctx: &RequestContext,
    negotiation: &Negotiation,
    common: &HashSet<ObjectId>,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<(), GitError> {
    // Objects the client already has: everything reachable from the common
    // commits.
    let mut excluded = HashSet::new();
    for oid in common {
        ctx.ensure_live()?;
        excluded.insert(*oid);
        let commit = odb.read_commit(*oid).await?;
        collect_tree_objects(odb, ctx, commit.tree_id, &mut excluded).await?;
    }

    let mut encoder = PackEncoder::new();
    for want in &negotiation.wants {
        let mut current = *want;
        let mut step = 0usize;
        loop {
            ctx.ensure_live()?;
            step += 1;
            if let Some(depth) = negotiation.deepen {
                if step > depth {
                    break;
                }
            }
            if common.contains(&current)
                || negotiation.client_shallow.contains(&current)
                || encoder.contains(&current)
            {
                break;
            }
            let commit = odb.read_commit(current).await?;
            encoder.insert(Entry::from(commit.clone()));
            insert_tree_objects(odb, ctx, commit.tree_id, &excluded, &mut encoder).await?;
            match commit.first_parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }

    encoder.encode_to(tx).await?;
    Ok(())
}

/// Record every tree and blob reachable from `tree_id` into `set`.
fn collect_tree_objects<'a>(
    odb: &'a dyn ObjectDatabase,
    ctx: &'a RequestContext,
    tree_id: ObjectId,
    set: &'a mut HashSet<ObjectId>,
) -> BoxFuture<'a, Result<(), GitError>> {
    async move {
        if !set.insert(tree_id) {
            return Ok(());
        }
        let tree = odb.read_tree(tree_id).await?;
        for entry in &tree.entries {
            ctx.ensure_live()?;
            if entry.mode.is_tree() {
                collect_tree_objects(odb, ctx, entry.id, set).await?;
            } else {
                set.insert(entry.id);
            }
        }
        Ok(())
    }
    .boxed()
}

/// Insert every tree and blob reachable from `tree_id` that the client does
/// not already have.
fn insert_tree_objects<'a>(
    odb: &'a dyn ObjectDatabase,
    ctx: &'a RequestContext,
    tree_id: ObjectId,
    excluded: &'a HashSet<ObjectId>,
    encoder: &'a mut PackEncoder,
) -> BoxFuture<'a, Result<(), GitError>> {
    async move {
        if excluded.contains(&tree_id) || encoder.contains(&tree_id) {
            return Ok(());
        }
        let tree = odb.read_tree(tree_id).await?;
        encoder.insert(Entry::from(tree.clone()));
        for entry in &tree.entries {
            ctx.ensure_live()?;
            if entry.mode.is_tree() {
                insert_tree_objects(odb, ctx, entry.id, excluded, encoder).await?;
            } else if !excluded.contains(&entry.id) && !encoder.contains(&entry.id) {
                let blob = odb.read_blob(entry.id).await?;
                encoder.insert(Entry::from(blob));
            }
        }
        Ok(())
    }
    .boxed()
}
