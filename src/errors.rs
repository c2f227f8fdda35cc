//! Error types for the githttp crate.
//!
//! One unified enumeration is used across the pkt-line codec, pack index
//! handling, locking, negotiation, and the push pipeline. It integrates with
//! `thiserror` for `Display` and error source chaining, and it knows how to
//! render itself both as an HTTP status and as the kebab-case token emitted in
//! a `report-status` stream.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the githttp library.
pub enum GitError {
    /// Malformed pkt-line, unknown capability, or bad OID syntax.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Authorization insufficient for the requested operation.
    #[error("forbidden")]
    Forbidden,

    /// Unknown repository, revision, or unreachable commit.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested representation cannot be produced.
    #[error("not acceptable: {0}")]
    NotAcceptable(String),

    /// A conditional request failed.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A push command would delete a reference.
    #[error("delete unallowed")]
    DeleteUnallowed,

    /// Reference name violates naming policy.
    #[error("invalid ref: {0}")]
    InvalidRef(String),

    /// Write attempted with read-only authorization.
    #[error("read only")]
    ReadOnly,

    /// Reference is restricted for the caller's authorization level.
    #[error("restricted ref: {0}")]
    RestrictedRef(String),

    /// The new OID of a push command is not a commit in the ODB after unpack.
    #[error("unknown commit: {0}")]
    UnknownCommit(String),

    /// Update is not a fast-forward of the current tip.
    #[error("non fast-forward")]
    NonFastForward,

    /// Command's old OID does not match the current reference target.
    #[error("stale info")]
    StaleInfo,

    /// The old OID of a push command is not a 40-hex SHA-1.
    #[error("invalid old oid: {0}")]
    InvalidOldOid(String),

    /// The new OID of a push command is not a 40-hex SHA-1.
    #[error("invalid new oid: {0}")]
    InvalidNewOid(String),

    /// Uploaded pack contained an object that is not a commit, tree, or blob.
    #[error("object type unallowed: {0}")]
    ObjectTypeUnallowed(String),

    /// The uploaded packfile could not be unpacked.
    #[error("unpack failed: {0}")]
    UnpackFailed(String),

    /// Pack index uses the 8-byte offset table.
    #[error("packfile too large: offset table requires 64-bit entries")]
    LargePackfile,

    /// Malformed or unsupported pack index (.idx) file.
    #[error("the `{0}` is not a valid idx file")]
    InvalidIdxFile(String),

    /// Malformed or unsupported pack file.
    #[error("the `{0}` is not a valid pack file")]
    InvalidPackFile(String),

    /// Malformed tree object.
    #[error("not a valid git tree object")]
    InvalidTreeObject,

    /// Malformed commit object.
    #[error("not a valid git commit object")]
    InvalidCommitObject,

    /// Invalid or unsupported git object type name.
    #[error("the `{0}` is not a valid git object type")]
    InvalidObjectType(String),

    /// Invalid SHA-1 formatting or value.
    #[error("the `{0}` is not a valid object id")]
    InvalidHashValue(String),

    /// Object missing from the object database.
    #[error("cannot find object: {0}")]
    ObjectNotFound(String),

    /// Split/merge walk visited more objects than the configured cap.
    #[error("tree exceeded object limit of {0}")]
    TreeExceededObjectLimit(usize),

    /// Name collision between a tree and a non-tree during merge.
    #[error("merge conflict on `{0}`: entry types differ")]
    MergeTypeMismatch(String),

    /// The request's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Lockfile acquisition or release failed.
    #[error("lockfile error: {0}")]
    Lockfile(String),

    /// I/O error from an underlying reader or writer.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by the caller-supplied update callback; the message
    /// is surfaced verbatim in the status report.
    #[error("{0}")]
    UpdateRejected(String),

    /// Internal invariant violation; surfaces as HTTP 500.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GitError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        GitError::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        GitError::NotFound(msg.into())
    }

    /// HTTP status code for this error at the dispatch surface.
    pub fn http_status(&self) -> u16 {
        match self {
            GitError::BadRequest(_)
            | GitError::InvalidOldOid(_)
            | GitError::InvalidNewOid(_)
            | GitError::InvalidRef(_)
            | GitError::InvalidIdxFile(_)
            | GitError::InvalidPackFile(_)
            | GitError::ObjectTypeUnallowed(_)
            | GitError::UnpackFailed(_)
            | GitError::LargePackfile
            | GitError::DeleteUnallowed
            | GitError::NonFastForward
            | GitError::StaleInfo
            | GitError::UnknownCommit(_)
            | GitError::UpdateRejected(_)
            | GitError::TreeExceededObjectLimit(_)
            | GitError::MergeTypeMismatch(_) => 400,
            GitError::Forbidden | GitError::ReadOnly | GitError::RestrictedRef(_) => 403,
            GitError::NotFound(_) | GitError::ObjectNotFound(_) => 404,
            GitError::NotAcceptable(_) => 406,
            GitError::PreconditionFailed(_) => 412,
            _ => 500,
        }
    }

    /// Kebab-case token for `ng <ref> <token>` lines in a push status report.
    ///
    /// `UpdateRejected` carries a caller-chosen message and is reported
    /// verbatim instead of a fixed token.
    pub fn status_token(&self) -> String {
        match self {
            GitError::BadRequest(_) => "bad-request".to_string(),
            GitError::Forbidden => "forbidden".to_string(),
            GitError::NotFound(_) | GitError::ObjectNotFound(_) => "not-found".to_string(),
            GitError::NotAcceptable(_) => "not-acceptable".to_string(),
            GitError::PreconditionFailed(_) => "precondition-failed".to_string(),
            GitError::DeleteUnallowed => "delete-unallowed".to_string(),
            GitError::InvalidRef(_) => "invalid-ref".to_string(),
            GitError::ReadOnly => "read-only".to_string(),
            GitError::RestrictedRef(_) => "restricted-ref".to_string(),
            GitError::UnknownCommit(_) => "unknown-commit".to_string(),
            GitError::NonFastForward => "non-fast-forward".to_string(),
            GitError::StaleInfo => "stale-info".to_string(),
            GitError::InvalidOldOid(_) => "invalid-old-oid".to_string(),
            GitError::InvalidNewOid(_) => "invalid-new-oid".to_string(),
            GitError::ObjectTypeUnallowed(_) => "object-type-unallowed".to_string(),
            GitError::UnpackFailed(_) | GitError::InvalidPackFile(_) | GitError::LargePackfile => {
                "unpack-failed".to_string()
            }
            GitError::UpdateRejected(msg) => msg.clone(),
            other => other.to_string().replace(' ', "-"),
        }
    }
}
