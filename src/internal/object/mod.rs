//! Object model definitions for Git blobs, trees, commits, and the shared
//! trait that lets the pack layers create strongly typed values from raw
//! bytes.

pub mod blob;
pub mod commit;
pub mod signature;
pub mod tree;
pub mod types;

use std::fmt::Display;

use crate::{errors::GitError, hash::ObjectId, internal::object::types::ObjectType};

/// **The Object Trait**
/// Defines the common interface for the object types a hosted repository can
/// contain.
pub trait ObjectTrait: Send + Sync + Display {
    /// Creates a new object from a byte slice.
    fn from_bytes(data: &[u8], id: ObjectId) -> Result<Self, GitError>
    where
        Self: Sized;

    /// Returns the type of the object.
    fn get_type(&self) -> ObjectType;

    /// Serializes the object payload (without the loose-object header).
    fn to_data(&self) -> Result<Vec<u8>, GitError>;

    /// Computes the object id from the serialized payload.
    fn object_id(&self) -> Result<ObjectId, GitError> {
        let data = self.to_data()?;
        Ok(ObjectId::from_type_and_data(self.get_type(), &data))
    }
}
