//! Server configuration and the embedder hook surface.
//!
//! The hook surface follows the callback contract of the dispatch layer: an
//! authorization decision per request, per-reference visibility filtering, a
//! veto over each push command, an optional pack-rewriting preprocess step,
//! and a request-context transform. Every method has the documented default
//! (deny, allow, noop, identity, identity), so embedders override only what
//! they need.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::GitError,
    protocol::types::RefUpdate,
    repository::Repository,
};

/// Construction-time options of the server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    /// Base directory of hosted repositories.
    pub root_path: PathBuf,
    /// Appended to the URL's repository name to find its directory
    /// (e.g. `.git`).
    #[serde(default)]
    pub repository_suffix: String,
    /// Gate for the `/+…` browse family.
    #[serde(default)]
    pub enable_browse: bool,
    /// Bypass the fast-forward requirement on pushes.
    #[serde(default)]
    pub allow_non_fast_forward: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
            repository_suffix: String::new(),
            enable_browse: false,
            allow_non_fast_forward: false,
        }
    }
}

/// What the authorization callback grants a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationLevel {
    /// No access at all.
    Denied,
    /// Pulls and browsing only.
    ReadOnly,
    /// Full access except the restricted references.
    Restricted,
    /// Everything.
    Full,
}

impl AuthorizationLevel {
    pub fn can_pull(&self) -> bool {
        !matches!(self, AuthorizationLevel::Denied)
    }

    pub fn can_push(&self) -> bool {
        matches!(self, AuthorizationLevel::Restricted | AuthorizationLevel::Full)
    }

    /// Whether the viewer may see (and push to) a given reference.
    pub fn can_see_reference(&self, name: &str) -> bool {
        match self {
            AuthorizationLevel::Restricted => name != RESTRICTED_REF,
            _ => true,
        }
    }
}

/// The reference hidden from restricted viewers and protected from
/// restricted writers.
pub const RESTRICTED_REF: &str = "refs/meta/config";

/// Operation class a request was dispatched to, as seen by the hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitOperation {
    Pull,
    Push,
    Browse,
}

/// Per-request state threaded through every handler: a cancellation signal
/// polled at each suspension point.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Walks call this between entries and bail out on a fired signal.
    pub fn ensure_live(&self) -> Result<(), GitError> {
        if self.cancel.is_cancelled() {
            Err(GitError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The embedder hook surface. Defaults: deny, allow, noop, identity,
/// identity.
#[async_trait]
pub trait ServerHooks: Send + Sync {
    /// Authorization level for the request. Default: deny everything.
    async fn authorize(
        &self,
        _ctx: &RequestContext,
        _repository_name: &str,
        _operation: GitOperation,
    ) -> AuthorizationLevel {
        AuthorizationLevel::Denied
    }

    /// Per-reference discovery filter on top of the level's own rules.
    /// Default: every reference is visible.
    fn reference_visible(&self, _level: AuthorizationLevel, _name: &str) -> bool {
        true
    }

    /// Veto over a single push command after the built-in validation passed.
    /// The returned message is surfaced verbatim in the status report.
    /// Default: accept.
    async fn update(
        &self,
        _ctx: &RequestContext,
        _repository: &Repository,
        _command: &RefUpdate,
    ) -> Result<(), String> {
        Ok(())
    }

    /// Rewrite the uploaded pack before the commit phase. Receives the side
    /// directory holding the indexed pack and returns the (possibly new) pack
    /// path and command list. Default: identity.
    async fn preprocess(
        &self,
        _ctx: &RequestContext,
        _repository: &Repository,
        _tmp_dir: &Path,
        pack_path: &Path,
        commands: Vec<RefUpdate>,
    ) -> Result<(PathBuf, Vec<RefUpdate>), GitError> {
        Ok((pack_path.to_path_buf(), commands))
    }

    /// Transform the request context before handling starts (attach
    /// deadlines, swap the cancellation token). Default: identity.
    fn request_context(&self, ctx: RequestContext) -> RequestContext {
        ctx
    }
}

/// The all-defaults hook set: a server that denies every request until the
/// embedder supplies a policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

#[async_trait]
impl ServerHooks for DefaultHooks {}
