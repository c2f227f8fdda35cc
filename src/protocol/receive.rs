//! Push pipeline (`git-receive-pack`).
//!
//! A push body is a pkt-line command phase followed by a binary packfile. The
//! pipeline parses and classifies every command, unpacks the pack into a side
//! directory (registered as an alternate, not yet committed), validates each
//! command against policy, optionally lets the embedder rewrite the pack, and
//! finally commits pack and reference updates under the repository's
//! exclusive lock. The status report is assembled after the commit phase so
//! the `unpack` line reflects what actually happened.
//!
//! Command errors are per-command: one rejected reference does not block its
//! siblings unless the client negotiated `atomic`. Without `report-status`
//! there is no in-band error channel, so the first failure surfaces as the
//! request error instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use tempfile::TempDir;

use crate::{
    config::{
        AuthorizationLevel, RESTRICTED_REF, RequestContext, ServerConfig, ServerHooks,
    },
    errors::GitError,
    hash::ObjectId,
    internal::pack::index::parse_index,
    odb::ObjectDatabase,
    protocol::{
        pkt::{PktLine, PktWriter, read_pkt_line},
        types::{Capability, RefUpdate, UpdatedRef},
    },
    repository::RepositoryHandle,
};

/// Most first-parent hops the fast-forward check will take before giving up.
pub const REV_WALK_LIMIT: usize = 10_000;

/// Outcome of one push request.
#[derive(Debug, Default)]
pub struct ReceivePackOutcome {
    /// Status report body; present iff the client negotiated `report-status`.
    pub report: Option<Bytes>,
    /// Reference updates that were actually applied.
    pub updated: Vec<UpdatedRef>,
}

struct ParsedPush {
    commands: Vec<RefUpdate>,
    report_status: bool,
    atomic: bool,
    pack_data: Option<Bytes>,
}

/// Run the push pipeline on a complete request body.
pub async fn receive_pack(
    handle: &mut RepositoryHandle,
    ctx: &RequestContext,
    hooks: &dyn ServerHooks,
    config: &ServerConfig,
    level: AuthorizationLevel,
    request: Bytes,
) -> Result<ReceivePackOutcome, GitError> {
    let mut push = parse_push_request(request)?;
    if push.commands.is_empty() {
        return Ok(ReceivePackOutcome::default());
    }

    let refs = handle.references().await?;
    classify_commands(&mut push.commands, &refs, level);

    // Unpack into a side directory next to the repository; the TempDir guard
    // cleans it up on every exit path.
    let mut side_dir: Option<TempDir> = None;
    let mut pack_path: Option<PathBuf> = None;
    if let Some(pack_data) = push.pack_data.take() {
        let dir = tempfile::Builder::new()
            .prefix("incoming-")
            .tempdir_in(handle.path())
            .map_err(GitError::Io)?;
        match unpack_and_vet(handle.odb(), pack_data, dir.path()).await {
            Ok(path) => {
                pack_path = Some(path);
                side_dir = Some(dir);
            }
            Err(pack_error) => {
                handle.odb().discard_alternates().await?;
                return pack_failure(&push, pack_error);
            }
        }
    }

    for command in push.commands.iter_mut().filter(|c| c.is_ok()) {
        if let Err(error) = validate_command(handle, ctx, hooks, config, level, command).await {
            command.fail(error);
        }
    }

    let all_clean = push.commands.iter().all(RefUpdate::is_ok);
    if push.atomic && !all_clean {
        for command in push.commands.iter_mut().filter(|c| c.is_ok()) {
            command.fail(GitError::UpdateRejected("atomic transaction failed".to_string()));
        }
    }

    // Preprocess hook: only meaningful when the push is still going ahead.
    if all_clean {
        if let Some(path) = pack_path.clone() {
            let tmp = side_dir.as_ref().expect("side dir exists with pack").path();
            let commands = std::mem::take(&mut push.commands);
            let (new_path, new_commands) = hooks
                .preprocess(ctx, handle.repository(), tmp, &path, commands)
                .await?;
            push.commands = new_commands;
            pack_path = Some(new_path);
        }
    }

    let committed = if push.commands.iter().any(RefUpdate::is_ok) {
        commit_phase(handle, ctx, &mut push.commands, pack_path.as_deref()).await?
    } else {
        handle.odb().discard_alternates().await?;
        Vec::new()
    };

    drop(side_dir);

    if push.report_status {
        let mut writer = PktWriter::new();
        writer.write_str("unpack ok\n")?;
        for command in &push.commands {
            writer.write_str(command.status_line())?;
        }
        Ok(ReceivePackOutcome {
            report: Some(writer.close()),
            updated: committed,
        })
    } else {
        // Without a status channel there is no way to attribute the failure
        // to its command, so the whole request is a bad-request.
        match push.commands.iter_mut().find_map(|c| c.error.take()) {
            Some(error) => Err(GitError::bad_request(error.to_string())),
            None => Ok(ReceivePackOutcome {
                report: None,
                updated: committed,
            }),
        }
    }
}

/// Split the body into commands, capabilities, and trailing pack bytes.
fn parse_push_request(request: Bytes) -> Result<ParsedPush, GitError> {
    let mut rest = request;
    let mut commands = Vec::new();
    let mut report_status = false;
    let mut atomic = false;
    let mut first_line = true;
    let mut saw_flush = false;

    loop {
        match read_pkt_line(&mut rest)? {
            PktLine::Flush => {
                saw_flush = true;
                break;
            }
            PktLine::Eof => break,
            PktLine::Data(line) => {
                let (payload, caps) = match memchr::memchr(0, &line) {
                    Some(nul) => (&line[..nul], Some(&line[nul + 1..])),
                    None => (&line[..], None),
                };
                if first_line {
                    if let Some(caps) = caps {
                        for token in String::from_utf8_lossy(caps).split_whitespace() {
                            match Capability::from_str(token) {
                                Ok(Capability::ReportStatus) => report_status = true,
                                Ok(Capability::Atomic) => atomic = true,
                                _ => {}
                            }
                        }
                    }
                    first_line = false;
                }
                commands.push(parse_command_line(payload)?);
            }
        }
    }

    if !commands.is_empty() && !saw_flush {
        return Err(GitError::bad_request("missing flush before pack data"));
    }

    let pack_data = if rest.is_empty() { None } else { Some(rest) };
    Ok(ParsedPush {
        commands,
        report_status,
        atomic,
        pack_data,
    })
}

/// `<old-oid> SP <new-oid> SP <ref-name>`. Unparsable ids become command
/// errors, not request errors, so they can be reported per reference.
fn parse_command_line(payload: &[u8]) -> Result<RefUpdate, GitError> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim_end_matches('\n');
    let mut fields = text.splitn(3, ' ');
    let (old_text, new_text, ref_name) = match (fields.next(), fields.next(), fields.next()) {
        (Some(old), Some(new), Some(name)) if !name.is_empty() => (old, new, name),
        _ => {
            return Err(GitError::bad_request(format!(
                "malformed push command `{text}`"
            )));
        }
    };

    let mut command = RefUpdate::new(
        ObjectId::ZERO,
        ObjectId::ZERO,
        ref_name.to_string(),
    );
    match ObjectId::from_str(old_text) {
        Ok(oid) => command.old_id = oid,
        Err(_) => {
            command.fail(GitError::InvalidOldOid(old_text.to_string()));
            return Ok(command);
        }
    }
    match ObjectId::from_str(new_text) {
        Ok(oid) => command.new_id = oid,
        Err(_) => {
            command.fail(GitError::InvalidNewOid(new_text.to_string()));
        }
    }
    Ok(command)
}

/// Stale-info and delete classification against the reference snapshot.
fn classify_commands(
    commands: &mut [RefUpdate],
    refs: &BTreeMap<String, ObjectId>,
    level: AuthorizationLevel,
) {
    for command in commands.iter_mut() {
        command.old_target = refs.get(&command.ref_name).copied();
        if command.error.is_some() {
            continue;
        }
        if !level.can_push() {
            command.fail(GitError::ReadOnly);
            continue;
        }
        if command.is_create() {
            if command.old_target.is_some() {
                command.fail(GitError::StaleInfo);
                continue;
            }
        } else if command.old_target != Some(command.old_id) {
            command.fail(GitError::StaleInfo);
            continue;
        }
        if command.is_delete() {
            command.fail(GitError::DeleteUnallowed);
        }
    }
}

/// Index the uploaded pack into the side directory and vet every object in
/// the resulting index.
async fn unpack_and_vet(
    odb: &dyn ObjectDatabase,
    pack_data: Bytes,
    side_dir: &Path,
) -> Result<PathBuf, GitError> {
    let (pack_path, idx_path) = odb.index_pack(pack_data, side_dir).await?;
    parse_index(&idx_path, odb).await?;
    Ok(pack_path)
}

/// Policy checks for one command once its objects are visible.
async fn validate_command(
    handle: &RepositoryHandle,
    ctx: &RequestContext,
    hooks: &dyn ServerHooks,
    config: &ServerConfig,
    level: AuthorizationLevel,
    command: &mut RefUpdate,
) -> Result<(), GitError> {
    let odb = handle.odb();
    let commit = match odb.read_commit(command.new_id).await {
        Ok(commit) => commit,
        Err(_) => return Err(GitError::UnknownCommit(command.new_id.to_string())),
    };
    command.log_message = commit.summary();

    if !config.allow_non_fast_forward {
        validate_fast_forward(odb, ctx, command.new_id, command.old_target).await?;
    }

    if level == AuthorizationLevel::Restricted && command.ref_name == RESTRICTED_REF {
        return Err(GitError::RestrictedRef(command.ref_name.clone()));
    }
    if !hooks.reference_visible(level, &command.ref_name) {
        return Err(GitError::RestrictedRef(command.ref_name.clone()));
    }

    hooks
        .update(ctx, handle.repository(), command)
        .await
        .map_err(GitError::UpdateRejected)?;
    Ok(())
}

/// Fast-forward means the current tip is a first-parent ancestor of the new
/// commit, within a bounded number of hops. An unborn reference always
/// fast-forwards.
async fn validate_fast_forward(
    odb: &dyn ObjectDatabase,
    ctx: &RequestContext,
    new_id: ObjectId,
    current_tip: Option<ObjectId>,
) -> Result<(), GitError> {
    let Some(tip) = current_tip else {
        return Ok(());
    };
    let mut cursor = new_id;
    for _ in 0..REV_WALK_LIMIT {
        ctx.ensure_live()?;
        if cursor == tip {
            return Ok(());
        }
        match odb.read_commit(cursor).await?.first_parent() {
            Some(parent) => cursor = parent,
            None => break,
        }
    }
    Err(GitError::NonFastForward)
}

/// Commit phase: exclusive lock, writepack, reference updates, in that order.
/// A failure after the pack is committed is fatal for the whole request.
async fn commit_phase(
    handle: &mut RepositoryHandle,
    ctx: &RequestContext,
    commands: &mut [RefUpdate],
    pack_path: Option<&Path>,
) -> Result<Vec<UpdatedRef>, GitError> {
    ctx.ensure_live()?;
    handle.lock_mut().lock()?;
    // Shared-to-exclusive promotion is not atomic: re-verify the snapshot
    // every clean command was classified against.
    handle.invalidate_cached_refs();
    handle.mark_do_not_return();
    let current_refs = handle.odb().references().await?;
    for command in commands.iter_mut().filter(|c| c.is_ok()) {
        if current_refs.get(&command.ref_name).copied() != command.old_target {
            command.fail(GitError::StaleInfo);
        }
    }
    if !commands.iter().any(RefUpdate::is_ok) {
        handle.odb().discard_alternates().await?;
        return Ok(Vec::new());
    }

    let odb = handle.odb();
    if let Some(path) = pack_path {
        odb.commit_pack(path).await?;
    }
    odb.refresh().await?;
    odb.discard_alternates().await?;

    let mut updated = Vec::new();
    for command in commands.iter_mut().filter(|c| c.is_ok()) {
        let expected_old = if command.is_create() {
            None
        } else {
            Some(command.old_id)
        };
        odb.update_reference(&command.ref_name, expected_old, command.new_id)
            .await
            .map_err(|e| {
                GitError::Internal(format!(
                    "reference update failed after pack commit for {}: {e}",
                    command.ref_name
                ))
            })?;

        let to_tree = match odb.read_commit(command.new_id).await {
            Ok(commit) => commit.tree_id.to_string(),
            Err(_) => ObjectId::ZERO.to_string(),
        };
        let from_tree = match command.old_target {
            Some(old) => match odb.read_commit(old).await {
                Ok(commit) => commit.tree_id.to_string(),
                Err(_) => ObjectId::ZERO.to_string(),
            },
            None => ObjectId::ZERO.to_string(),
        };
        updated.push(UpdatedRef {
            name: command.ref_name.clone(),
            from: command.old_id.to_string(),
            to: command.new_id.to_string(),
            from_tree,
            to_tree,
        });
    }
    Ok(updated)
}

/// Pack-level failure: poison every command and report, or fail the request
/// when there is no status channel.
fn pack_failure(
    push: &ParsedPush,
    pack_error: GitError,
) -> Result<ReceivePackOutcome, GitError> {
    if !push.report_status {
        return Err(pack_error);
    }
    let mut writer = PktWriter::new();
    writer.write_str(format!("unpack {}\n", pack_error.status_token()))?;
    for command in &push.commands {
        writer.write_str(format!("ng {} unpack-failed\n", command.ref_name))?;
    }
    Ok(ReceivePackOutcome {
        report: Some(writer.close()),
        updated: Vec::new(),
    })
}
