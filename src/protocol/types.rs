//! Shared vocabulary of the smart protocol handlers: service names,
//! capability tokens, push commands, and the reference discovery result.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{errors::GitError, hash::ObjectId};

/// Protocol constants.
pub const LF: char = '\n';
pub const SP: char = ' ';
pub const NUL: char = '\0';

/// Agent token advertised on both services.
pub const AGENT: &str = concat!("githttp/", env!("CARGO_PKG_VERSION"));

/// Git service types for the smart protocol.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ServiceType {
    UploadPack,
    ReceivePack,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceType::UploadPack => write!(f, "git-upload-pack"),
            ServiceType::ReceivePack => write!(f, "git-receive-pack"),
        }
    }
}

impl FromStr for ServiceType {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git-upload-pack" => Ok(ServiceType::UploadPack),
            "git-receive-pack" => Ok(ServiceType::ReceivePack),
            _ => Err(GitError::bad_request(format!("invalid service `{s}`"))),
        }
    }
}

/// Capability tokens this server advertises or understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// Client/server identification.
    Agent(String),
    /// Wants may name any advertised tip directly.
    AllowTipSha1InWant,
    /// Offset-based delta encoding permitted in packs.
    OfsDelta,
    /// Depth-limited clones.
    Shallow,
    /// Client may send thin packs.
    ThinPack,
    /// All-or-nothing push semantics.
    Atomic,
    /// Push wants the structured status stream back.
    ReportStatus,
    /// Symbolic ref advertisement, e.g. `symref=HEAD:refs/heads/master`.
    Symref(String),
    /// Any other `key=value` token; ignored per protocol rules.
    KeyValue(String, String),
    /// Unrecognized bare token; rejected in strict positions.
    Unknown(String),
}

impl FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("agent=") {
            return Ok(Capability::Agent(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("symref=") {
            return Ok(Capability::Symref(rest.to_string()));
        }
        match s {
            "allow-tip-sha1-in-want" => Ok(Capability::AllowTipSha1InWant),
            "ofs-delta" => Ok(Capability::OfsDelta),
            "shallow" => Ok(Capability::Shallow),
            "thin-pack" => Ok(Capability::ThinPack),
            "atomic" => Ok(Capability::Atomic),
            "report-status" => Ok(Capability::ReportStatus),
            _ => match s.split_once('=') {
                Some((key, value)) => {
                    Ok(Capability::KeyValue(key.to_string(), value.to_string()))
                }
                None => Ok(Capability::Unknown(s.to_string())),
            },
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Agent(agent) => write!(f, "agent={agent}"),
            Capability::AllowTipSha1InWant => write!(f, "allow-tip-sha1-in-want"),
            Capability::OfsDelta => write!(f, "ofs-delta"),
            Capability::Shallow => write!(f, "shallow"),
            Capability::ThinPack => write!(f, "thin-pack"),
            Capability::Atomic => write!(f, "atomic"),
            Capability::ReportStatus => write!(f, "report-status"),
            Capability::Symref(symref) => write!(f, "symref={symref}"),
            Capability::KeyValue(key, value) => write!(f, "{key}={value}"),
            Capability::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// Capability string advertised for pulls, without the symref token.
pub fn pull_capabilities() -> String {
    format!("agent={AGENT} allow-tip-sha1-in-want ofs-delta shallow thin-pack")
}

/// Capability string advertised for pushes.
pub fn push_capabilities() -> String {
    format!("agent={AGENT} atomic ofs-delta report-status")
}

/// One command of a push request:
/// `<old-oid> SP <new-oid> SP <ref-name>`.
#[derive(Debug)]
pub struct RefUpdate {
    pub old_id: ObjectId,
    pub new_id: ObjectId,
    pub ref_name: String,
    /// The reference's target when the command was parsed, used by the
    /// stale-info check and reported back to the update callback.
    pub old_target: Option<ObjectId>,
    /// First error this command ran into, if any.
    pub error: Option<GitError>,
    /// Summary line of the new commit, filled during validation.
    pub log_message: String,
}

impl RefUpdate {
    pub fn new(old_id: ObjectId, new_id: ObjectId, ref_name: String) -> Self {
        Self {
            old_id,
            new_id,
            ref_name,
            old_target: None,
            error: None,
            log_message: String::new(),
        }
    }

    /// A command creates its ref iff the old id is zero.
    pub fn is_create(&self) -> bool {
        self.old_id.is_zero()
    }

    /// A command deletes its ref iff the new id is zero. Deletes are always
    /// rejected by this server.
    pub fn is_delete(&self) -> bool {
        self.new_id.is_zero()
    }

    pub fn fail(&mut self, error: GitError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// `ok <ref>` or `ng <ref> <token>` line for the status report.
    pub fn status_line(&self) -> String {
        match &self.error {
            None => format!("ok {}\n", self.ref_name),
            Some(error) => format!("ng {} {}\n", self.ref_name, error.status_token()),
        }
    }
}

/// Applied reference change reported to the embedder after a push commits.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UpdatedRef {
    pub name: String,
    pub from: String,
    pub to: String,
    pub from_tree: String,
    pub to_tree: String,
}

/// Result of reference discovery before rendering.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    pub references: BTreeMap<String, ObjectId>,
    pub capabilities: Vec<Capability>,
    pub head_symref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_parse_and_display() {
        assert_eq!(
            "git-upload-pack".parse::<ServiceType>().unwrap(),
            ServiceType::UploadPack
        );
        assert_eq!(ServiceType::ReceivePack.to_string(), "git-receive-pack");
        assert!("git-frobnicate".parse::<ServiceType>().is_err());
    }

    #[test]
    fn test_capability_classification() {
        assert_eq!(
            "thin-pack".parse::<Capability>().unwrap(),
            Capability::ThinPack
        );
        assert_eq!(
            "agent=git/2.14.1".parse::<Capability>().unwrap(),
            Capability::Agent("git/2.14.1".to_string())
        );
        // Unknown k=v tokens are tolerated, bare unknowns are not.
        assert_eq!(
            "object-format=sha1".parse::<Capability>().unwrap(),
            Capability::KeyValue("object-format".to_string(), "sha1".to_string())
        );
        assert_eq!(
            "multi_ack".parse::<Capability>().unwrap(),
            Capability::Unknown("multi_ack".to_string())
        );
    }

    #[test]
    fn test_create_delete_classification() {
        let some = ObjectId::hash_bytes(b"x");
        let create = RefUpdate::new(ObjectId::ZERO, some, "refs/heads/master".into());
        assert!(create.is_create() && !create.is_delete());
        let delete = RefUpdate::new(some, ObjectId::ZERO, "refs/heads/master".into());
        assert!(delete.is_delete() && !delete.is_create());
        let update = RefUpdate::new(some, some, "refs/heads/master".into());
        assert!(!update.is_create() && !update.is_delete());
    }

    #[test]
    fn test_status_lines() {
        let some = ObjectId::hash_bytes(b"x");
        let mut cmd = RefUpdate::new(ObjectId::ZERO, some, "refs/heads/master".into());
        assert_eq!(cmd.status_line(), "ok refs/heads/master\n");
        cmd.fail(GitError::NonFastForward);
        // Only the first error sticks.
        cmd.fail(GitError::StaleInfo);
        assert_eq!(cmd.status_line(), "ng refs/heads/master non-fast-forward\n");
    }
}
