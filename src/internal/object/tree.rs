//! Tree objects: one directory level of a repository snapshot.
//!
//! Each entry is serialized as `<mode> SP <name> NUL <20-byte id>`. Entries
//! are kept in the canonical Git order, which compares directory names as if
//! they carried a trailing `/` (so `a.txt` sorts before `a/` content does
//! not split the namespace).

use std::cmp::Ordering;
use std::fmt::Display;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::ObjectId,
    internal::object::{ObjectTrait, types::ObjectType},
};

/// Entry modes as rendered in tree payloads.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum TreeEntryMode {
    Blob,
    BlobExecutable,
    Link,
    Tree,
    Commit,
}

impl TreeEntryMode {
    /// ASCII octal form written into the tree payload.
    pub fn to_bytes(&self) -> &'static [u8] {
        match self {
            TreeEntryMode::Blob => b"100644",
            TreeEntryMode::BlobExecutable => b"100755",
            TreeEntryMode::Link => b"120000",
            TreeEntryMode::Tree => b"40000",
            TreeEntryMode::Commit => b"160000",
        }
    }

    pub fn from_bytes(mode: &[u8]) -> Result<TreeEntryMode, GitError> {
        Ok(match mode {
            b"100644" | b"100664" => TreeEntryMode::Blob,
            b"100755" => TreeEntryMode::BlobExecutable,
            b"120000" => TreeEntryMode::Link,
            b"40000" | b"040000" => TreeEntryMode::Tree,
            b"160000" => TreeEntryMode::Commit,
            _ => {
                return Err(GitError::InvalidTreeObject);
            }
        })
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, TreeEntryMode::Tree)
    }

    /// Mode as the decimal number exposed in browse JSON (`33188` for a
    /// regular file, `16384` for a tree).
    pub fn as_decimal(&self) -> u32 {
        match self {
            TreeEntryMode::Blob => 0o100644,
            TreeEntryMode::BlobExecutable => 0o100755,
            TreeEntryMode::Link => 0o120000,
            TreeEntryMode::Tree => 0o040000,
            TreeEntryMode::Commit => 0o160000,
        }
    }
}

#[derive(PartialEq, Eq, Hash, Debug, Clone, Serialize, Deserialize)]
pub struct TreeEntry {
    pub mode: TreeEntryMode,
    pub id: ObjectId,
    pub name: String,
}

impl TreeEntry {
    pub fn new(mode: TreeEntryMode, id: ObjectId, name: String) -> TreeEntry {
        TreeEntry { mode, id, name }
    }

    /// Canonical Git ordering key: directories compare as `name + "/"`.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.mode.is_tree() {
            key.push(b'/');
        }
        key
    }
}

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub id: ObjectId,
    pub entries: Vec<TreeEntry>,
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "tree {}", self.id)?;
        for entry in &self.entries {
            writeln!(
                f,
                "{} {} {}",
                String::from_utf8_lossy(entry.mode.to_bytes()),
                entry.id,
                entry.name
            )?;
        }
        Ok(())
    }
}

impl Tree {
    /// Build a tree from entries, sorting them canonically and computing the
    /// id from the serialized payload.
    pub fn from_entries(mut entries: Vec<TreeEntry>) -> Result<Tree, GitError> {
        entries.sort_by(|a, b| compare_entries(a, b));
        entries.dedup_by(|a, b| a.name == b.name && a.mode.is_tree() == b.mode.is_tree());
        let mut tree = Tree {
            id: ObjectId::ZERO,
            entries,
        };
        tree.id = ObjectId::from_type_and_data(ObjectType::Tree, &tree.to_data()?);
        Ok(tree)
    }

    /// The empty tree.
    pub fn empty() -> Tree {
        Tree::from_entries(Vec::new()).unwrap()
    }

    pub fn entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn compare_entries(a: &TreeEntry, b: &TreeEntry) -> Ordering {
    a.sort_key().cmp(&b.sort_key())
}

impl ObjectTrait for Tree {
    fn from_bytes(data: &[u8], id: ObjectId) -> Result<Self, GitError> {
        let mut entries = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let mode_end = rest.find_byte(0x20).ok_or(GitError::InvalidTreeObject)?;
            let mode = TreeEntryMode::from_bytes(&rest[..mode_end])?;
            rest = &rest[mode_end + 1..];

            let name_end = rest.find_byte(0x00).ok_or(GitError::InvalidTreeObject)?;
            let name = String::from_utf8(rest[..name_end].to_vec())
                .map_err(|_| GitError::InvalidTreeObject)?;
            rest = &rest[name_end + 1..];

            if rest.len() < 20 {
                return Err(GitError::InvalidTreeObject);
            }
            let entry_id =
                ObjectId::from_slice(&rest[..20]).map_err(|_| GitError::InvalidTreeObject)?;
            rest = &rest[20..];

            entries.push(TreeEntry {
                mode,
                id: entry_id,
                name,
            });
        }
        Ok(Tree { id, entries })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tree
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut data = Vec::new();
        for entry in &self.entries {
            data.extend_from_slice(entry.mode.to_bytes());
            data.push(0x20);
            data.extend_from_slice(entry.name.as_bytes());
            data.push(0x00);
            data.extend_from_slice(entry.id.as_bytes());
        }
        Ok(data)
    }
}
