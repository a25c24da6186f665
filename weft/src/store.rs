//! Payload-object store capability.
//!
//! The engine never inspects payload objects; it refers to them by name
//! and delegates lookup, lifetime pinning and (de)serialization to an
//! implementation provided by the embedding process. Codec and layout of
//! the serialized form stay entirely on the implementor's side.

use anyhow::Result;

use crate::id::Rank;
use crate::message::ArrayType;

/// Claim ticket for an object known to the local store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectHandle {
    pub name: String,
}

impl ObjectHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A reference inside a deserialized object that the store could not
/// resolve locally and that has to be fetched before the object is usable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MissingRef {
    Object { name: String },
    Array { name: String, array_type: ArrayType },
}

/// Result of deserializing a shipped object.
#[derive(Debug)]
pub struct Deserialized {
    pub handle: ObjectHandle,
    /// Sub-references to fetch before completion may be reported.
    pub missing: Vec<MissingRef>,
}

pub trait ObjectStore: Send + Sync {
    /// Looks the object up without touching its lifetime.
    fn get(&self, name: &str) -> Option<ObjectHandle>;

    /// Pins the object so it survives while a transfer references it.
    fn ref_object(&self, name: &str) -> Result<()>;

    /// Releases a pin taken with [`ObjectStore::ref_object`].
    fn release(&self, name: &str) -> Result<()>;

    /// Whether two ranks share one object group, making announcements
    /// between them deliverable without copying.
    fn same_group(&self, a: Rank, b: Rank) -> bool;

    fn serialize(&self, name: &str) -> Result<Vec<u8>>;

    fn serialize_array(&self, name: &str, array_type: ArrayType) -> Result<Vec<u8>>;

    /// Registers a shipped object locally, reporting unresolved
    /// sub-references.
    fn deserialize(&self, name: &str, payload: &[u8]) -> Result<Deserialized>;

    /// Registers a shipped array locally.
    fn deserialize_array(&self, name: &str, array_type: ArrayType, payload: &[u8]) -> Result<()>;
}
