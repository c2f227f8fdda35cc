//! Object type enumeration used across the pack and object modules.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::GitError;

/// In Git, each object type is assigned a unique integer value used in pack
/// entry headers:
///
/// * `Commit` (1), `Tree` (2), `Blob` (3), `Tag` (4)
/// * `OffsetDelta` (6) and `HashDelta` (7) are delta encodings against a base
///   object addressed by offset or id.
///
/// This server only ever *accepts* commits, trees, and blobs from clients; the
/// remaining values exist so uploaded packs containing them can be rejected
/// with a precise error.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
    OffsetDelta = 6,
    HashDelta = 7,
}

const COMMIT_OBJECT_TYPE: &[u8] = b"commit";
const TREE_OBJECT_TYPE: &[u8] = b"tree";
const BLOB_OBJECT_TYPE: &[u8] = b"blob";
const TAG_OBJECT_TYPE: &[u8] = b"tag";

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ObjectType::Commit => write!(f, "commit"),
            ObjectType::Tree => write!(f, "tree"),
            ObjectType::Blob => write!(f, "blob"),
            ObjectType::Tag => write!(f, "tag"),
            ObjectType::OffsetDelta => write!(f, "ofs-delta"),
            ObjectType::HashDelta => write!(f, "ref-delta"),
        }
    }
}

impl ObjectType {
    /// Loose-object header bytes for this type.
    pub fn to_bytes(&self) -> &'static [u8] {
        match self {
            ObjectType::Commit => COMMIT_OBJECT_TYPE,
            ObjectType::Tree => TREE_OBJECT_TYPE,
            ObjectType::Blob => BLOB_OBJECT_TYPE,
            ObjectType::Tag => TAG_OBJECT_TYPE,
            // Deltas never appear in loose-object headers.
            ObjectType::OffsetDelta | ObjectType::HashDelta => unreachable!(),
        }
    }

    pub fn from_string(s: &str) -> Result<ObjectType, GitError> {
        match s {
            "commit" => Ok(ObjectType::Commit),
            "tree" => Ok(ObjectType::Tree),
            "blob" => Ok(ObjectType::Blob),
            "tag" => Ok(ObjectType::Tag),
            _ => Err(GitError::InvalidObjectType(s.to_string())),
        }
    }

    /// 3-bit pack entry header type id.
    pub fn to_pack_type_u8(&self) -> u8 {
        *self as u8
    }

    /// Decode a 3-bit pack entry header type id.
    pub fn from_pack_type_u8(number: u8) -> Result<ObjectType, GitError> {
        match number {
            1 => Ok(ObjectType::Commit),
            2 => Ok(ObjectType::Tree),
            3 => Ok(ObjectType::Blob),
            4 => Ok(ObjectType::Tag),
            6 => Ok(ObjectType::OffsetDelta),
            7 => Ok(ObjectType::HashDelta),
            _ => Err(GitError::InvalidObjectType(format!(
                "invalid pack object type number: {number}"
            ))),
        }
    }

    /// Whether a client is allowed to upload this object type.
    pub fn is_upload_allowed(&self) -> bool {
        matches!(
            self,
            ObjectType::Commit | ObjectType::Tree | ObjectType::Blob
        )
    }
}
