//! Lightweight representation of one undeltified object as it sits in a pack
//! stream, with conversions from the strongly typed object model.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::{
    hash::ObjectId,
    internal::object::{ObjectTrait, blob::Blob, commit::Commit, tree::Tree, types::ObjectType},
};

/// Git object data from a pack file.
#[derive(Eq, Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
    pub hash: ObjectId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.obj_type == other.obj_type && self.hash == other.hash
    }
}

impl Hash for Entry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.obj_type.hash(state);
        self.hash.hash(state);
    }
}

impl From<Blob> for Entry {
    fn from(value: Blob) -> Self {
        Self {
            obj_type: ObjectType::Blob,
            hash: value.id,
            data: value.data,
        }
    }
}

impl From<Commit> for Entry {
    fn from(value: Commit) -> Self {
        Self {
            obj_type: ObjectType::Commit,
            data: value.to_data().unwrap(),
            hash: value.id,
        }
    }
}

impl From<Tree> for Entry {
    fn from(value: Tree) -> Self {
        Self {
            obj_type: ObjectType::Tree,
            data: value.to_data().unwrap(),
            hash: value.id,
        }
    }
}
