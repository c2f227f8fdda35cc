//! Blob objects: the raw file contents stored in a repository. A blob has no
//! structure of its own; its payload is byte-for-byte the file content.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::ObjectId,
    internal::object::{ObjectTrait, types::ObjectType},
};

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    pub id: ObjectId,
    pub data: Vec<u8>,
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "blob {} ({} bytes)", self.id, self.data.len())
    }
}

impl Blob {
    pub fn from_content(content: impl AsRef<[u8]>) -> Blob {
        let data = content.as_ref().to_vec();
        let id = ObjectId::from_type_and_data(ObjectType::Blob, &data);
        Blob { id, data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl ObjectTrait for Blob {
    fn from_bytes(data: &[u8], id: ObjectId) -> Result<Self, GitError> {
        Ok(Blob {
            id,
            data: data.to_vec(),
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Blob
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        Ok(self.data.clone())
    }
}
