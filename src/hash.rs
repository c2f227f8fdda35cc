//! Object identifiers.
//!
//! Every object in a hosted repository is addressed by its 20-byte SHA-1,
//! rendered as 40 lowercase hex characters on the wire. The all-zero value is
//! the distinguished "no object" marker used by push commands for creates and
//! (rejected) deletes.

use std::{fmt::Display, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::internal::object::types::ObjectType;

/// Hex length of a rendered object id.
pub const HEX_LEN: usize = 40;

/// A 20-byte SHA-1 object identifier.
///
/// Ordering is byte-wise, matching the sort order of the `.idx` name table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// The "no object" marker.
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    pub fn new(bytes: [u8; 20]) -> Self {
        ObjectId(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Compute the id of raw payload bytes directly (used for pack trailers
    /// and idx checksums, where no object header participates).
    pub fn hash_bytes(data: &[u8]) -> ObjectId {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        ObjectId(bytes)
    }

    /// Compute the id of a git object: `sha1("<type> <len>\0" + payload)`.
    pub fn from_type_and_data(kind: ObjectType, data: &[u8]) -> ObjectId {
        let mut hasher = Sha1::new();
        hasher.update(kind.to_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        ObjectId(bytes)
    }

    pub fn from_slice(data: &[u8]) -> Result<ObjectId, String> {
        if data.len() != 20 {
            return Err(format!("expected 20 bytes, got {}", data.len()));
        }
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(data);
        Ok(ObjectId(bytes))
    }

    /// Read a binary object id from a stream (idx name table, pack trailer).
    pub fn from_stream(reader: &mut impl io::Read) -> io::Result<ObjectId> {
        let mut bytes = [0u8; 20];
        reader.read_exact(&mut bytes)?;
        Ok(ObjectId(bytes))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::ZERO
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Parse 40 hex characters into an `ObjectId`. Either case is accepted.
impl FromStr for ObjectId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HEX_LEN {
            return Err(format!("invalid object id length {}", s.len()));
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let mut h = [0u8; 20];
        h.copy_from_slice(&bytes);
        Ok(ObjectId(h))
    }
}
