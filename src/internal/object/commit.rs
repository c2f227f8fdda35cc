//! Commit objects.
//!
//! A commit records one snapshot of the repository: the id of its root tree,
//! zero or more parent commit ids, the author and committer signatures, and a
//! free-form message. The first parent chain is what the fast-forward check
//! and the pull negotiation walk.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::ObjectId,
    internal::object::{
        ObjectTrait,
        signature::{Signature, SignatureType},
        types::ObjectType,
    },
};

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: ObjectId,
    pub tree_id: ObjectId,
    pub parent_ids: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "tree: {}", self.tree_id)?;
        for parent in self.parent_ids.iter() {
            writeln!(f, "parent: {parent}")?;
        }
        writeln!(f, "author {}", self.author)?;
        writeln!(f, "committer {}", self.committer)?;
        writeln!(f, "{}", self.message)
    }
}

impl Commit {
    pub fn new(
        author: Signature,
        committer: Signature,
        tree_id: ObjectId,
        parent_ids: Vec<ObjectId>,
        message: &str,
    ) -> Commit {
        let mut commit = Commit {
            id: ObjectId::ZERO,
            tree_id,
            parent_ids,
            author,
            committer,
            message: message.to_string(),
        };
        commit.id = ObjectId::from_type_and_data(ObjectType::Commit, &commit.to_data().unwrap());
        commit
    }

    /// First parent, if any. Depth-limited walks follow only this edge.
    pub fn first_parent(&self) -> Option<ObjectId> {
        self.parent_ids.first().copied()
    }

    /// The first non-empty message line, used as the reflog-style summary.
    pub fn summary(&self) -> String {
        self.message
            .lines()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.to_owned())
            .unwrap_or_else(|| self.message.clone())
    }
}

impl ObjectTrait for Commit {
    fn from_bytes(data: &[u8], id: ObjectId) -> Result<Self, GitError>
    where
        Self: Sized,
    {
        let mut rest = data;

        let tree_end = rest.find_byte(0x0a).ok_or(GitError::InvalidCommitObject)?;
        if !rest.starts_with(b"tree ") {
            return Err(GitError::InvalidCommitObject);
        }
        let tree_id = ObjectId::from_str(
            std::str::from_utf8(&rest[5..tree_end]).map_err(|_| GitError::InvalidCommitObject)?,
        )
        .map_err(|_| GitError::InvalidCommitObject)?;
        rest = &rest[tree_end + 1..];

        let mut parent_ids = Vec::new();
        while rest.starts_with(b"parent ") {
            let line_end = rest.find_byte(0x0a).ok_or(GitError::InvalidCommitObject)?;
            let parent = ObjectId::from_str(
                std::str::from_utf8(&rest[7..line_end])
                    .map_err(|_| GitError::InvalidCommitObject)?,
            )
            .map_err(|_| GitError::InvalidCommitObject)?;
            parent_ids.push(parent);
            rest = &rest[line_end + 1..];
        }

        let author_end = rest.find_byte(0x0a).ok_or(GitError::InvalidCommitObject)?;
        let author = Signature::from_data(rest[..author_end].to_vec())?;
        if author.signature_kind != SignatureType::Author {
            return Err(GitError::InvalidCommitObject);
        }
        rest = &rest[author_end + 1..];

        let committer_end = rest.find_byte(0x0a).ok_or(GitError::InvalidCommitObject)?;
        let committer = Signature::from_data(rest[..committer_end].to_vec())?;
        if committer.signature_kind != SignatureType::Committer {
            return Err(GitError::InvalidCommitObject);
        }
        rest = &rest[committer_end + 1..];

        // Anything after the committer line (gpgsig blocks included) belongs
        // to the message so serialization stays lossless.
        let message = String::from_utf8_lossy(rest).to_string();

        Ok(Commit {
            id,
            tree_id,
            parent_ids,
            author,
            committer,
            message,
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Commit
    }

    /// [Git-Internals-Git-Objects](https://git-scm.com/book/en/v2/Git-Internals-Git-Objects)
    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut data = Vec::new();

        data.extend(b"tree ");
        data.extend(self.tree_id.to_string().as_bytes());
        data.extend(&[0x0a]);

        for parent in &self.parent_ids {
            data.extend(b"parent ");
            data.extend(parent.to_string().as_bytes());
            data.extend(&[0x0a]);
        }

        data.extend(self.author.to_data()?);
        data.extend(&[0x0a]);
        data.extend(self.committer.to_data()?);
        data.extend(&[0x0a]);
        data.extend(self.message.as_bytes());

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(kind: SignatureType) -> Signature {
        Signature::new(
            kind,
            "tester".to_string(),
            "tester@example.com".to_string(),
            1503543845,
            "+0000".to_string(),
        )
    }

    fn sample_commit(parents: Vec<ObjectId>) -> Commit {
        Commit::new(
            sig(SignatureType::Author),
            sig(SignatureType::Committer),
            ObjectId::hash_bytes(b"tree"),
            parents,
            "\nadd feature\n\ndetails follow\n",
        )
    }

    #[test]
    fn test_round_trip() {
        let commit = sample_commit(vec![ObjectId::hash_bytes(b"p1"), ObjectId::hash_bytes(b"p2")]);
        let data = commit.to_data().unwrap();
        let parsed = Commit::from_bytes(&data, commit.id).unwrap();
        assert_eq!(parsed.tree_id, commit.tree_id);
        assert_eq!(parsed.parent_ids, commit.parent_ids);
        assert_eq!(parsed.author, commit.author);
        assert_eq!(parsed.message, commit.message);
        assert_eq!(parsed.object_id().unwrap(), commit.id);
    }

    #[test]
    fn test_summary_skips_blank_lines() {
        let commit = sample_commit(vec![]);
        assert_eq!(commit.summary(), "add feature");
    }

    #[test]
    fn test_first_parent() {
        let p1 = ObjectId::hash_bytes(b"p1");
        let commit = sample_commit(vec![p1, ObjectId::hash_bytes(b"p2")]);
        assert_eq!(commit.first_parent(), Some(p1));
        assert_eq!(sample_commit(vec![]).first_parent(), None);
    }

    #[test]
    fn test_rejects_missing_tree_header() {
        let data = b"parent 0000000000000000000000000000000000000000\n".to_vec();
        assert!(Commit::from_bytes(&data, ObjectId::ZERO).is_err());
    }
}
