use std::collections::HashMap;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use weft::{ArrayType, Deserialized, MissingRef, ObjectHandle, ObjectStore, Rank};

/// In-memory object store with scriptable group layout and sub-reference
/// reporting.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    /// Group id per rank; ranks sharing an id share objects.
    groups: Vec<usize>,
}

#[derive(Default)]
struct StoreInner {
    objects: HashMap<String, Stored>,
    arrays: HashMap<(String, ArrayType), Vec<u8>>,
    /// Missing refs to report the next time the named object is
    /// deserialized.
    scripted_missing: HashMap<String, Vec<MissingRef>>,
}

struct Stored {
    refs: usize,
    payload: Vec<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_groups(Vec::new())
    }

    pub fn with_groups(groups: Vec<usize>) -> Self {
        Self { inner: Mutex::new(StoreInner::default()), groups }
    }

    pub fn insert(&self, name: impl Into<String>) {
        self.insert_with_payload(name, Vec::new());
    }

    pub fn insert_with_payload(&self, name: impl Into<String>, payload: Vec<u8>) {
        self.inner
            .lock()
            .objects
            .insert(name.into(), Stored { refs: 0, payload });
    }

    pub fn insert_array(&self, name: impl Into<String>, array_type: ArrayType, payload: Vec<u8>) {
        self.inner.lock().arrays.insert((name.into(), array_type), payload);
    }

    /// Makes the next deserialization of `name` report these unresolved
    /// sub-references.
    pub fn script_missing(&self, name: impl Into<String>, missing: Vec<MissingRef>) {
        self.inner.lock().scripted_missing.insert(name.into(), missing);
    }

    pub fn ref_count(&self, name: &str) -> usize {
        self.inner.lock().objects.get(name).map(|s| s.refs).unwrap_or(0)
    }

    pub fn has_array(&self, name: &str, array_type: ArrayType) -> bool {
        self.inner.lock().arrays.contains_key(&(name.to_owned(), array_type))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, name: &str) -> Option<ObjectHandle> {
        self.inner
            .lock()
            .objects
            .contains_key(name)
            .then(|| ObjectHandle::new(name))
    }

    fn ref_object(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(stored) = inner.objects.get_mut(name) else {
            bail!("unknown object {name}");
        };
        stored.refs += 1;
        Ok(())
    }

    fn release(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(stored) = inner.objects.get_mut(name) else {
            bail!("unknown object {name}");
        };
        if stored.refs == 0 {
            bail!("release of unpinned object {name}");
        }
        stored.refs -= 1;
        Ok(())
    }

    fn same_group(&self, a: Rank, b: Rank) -> bool {
        if a == b {
            return true;
        }
        match (self.groups.get(a), self.groups.get(b)) {
            (Some(ga), Some(gb)) => ga == gb,
            _ => false,
        }
    }

    fn serialize(&self, name: &str) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let Some(stored) = inner.objects.get(name) else {
            bail!("cannot serialize unknown object {name}");
        };
        Ok(stored.payload.clone())
    }

    fn serialize_array(&self, name: &str, array_type: ArrayType) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let Some(payload) = inner.arrays.get(&(name.to_owned(), array_type)) else {
            bail!("cannot serialize unknown array {name}");
        };
        Ok(payload.clone())
    }

    fn deserialize(&self, name: &str, payload: &[u8]) -> Result<Deserialized> {
        let mut inner = self.inner.lock();
        let missing = inner.scripted_missing.remove(name).unwrap_or_default();
        inner
            .objects
            .insert(name.to_owned(), Stored { refs: 0, payload: payload.to_vec() });
        Ok(Deserialized { handle: ObjectHandle::new(name), missing })
    }

    fn deserialize_array(&self, name: &str, array_type: ArrayType, payload: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .arrays
            .insert((name.to_owned(), array_type), payload.to_vec());
        Ok(())
    }
}
