//! In-memory `ObjectStorage` (§4.10), used by tests and as a reference for
//! what a real object-store driver's contract looks like.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::storage::ObjectStorage;

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStorage for MemoryObjectStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_values() {
        let store = MemoryObjectStore::new();
        store.set("a/1", b"hello").unwrap();
        assert_eq!(store.get("a/1").unwrap(), b"hello");
    }

    #[test]
    fn missing_key_is_not_found() {
        let store = MemoryObjectStore::new();
        assert!(store.get("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn list_respects_prefix() {
        let store = MemoryObjectStore::new();
        store.set("blocks/1", b"a").unwrap();
        store.set("blocks/2", b"b").unwrap();
        store.set("other/1", b"c").unwrap();
        let mut keys = store.list("blocks/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["blocks/1".to_string(), "blocks/2".to_string()]);
    }

    #[test]
    fn delete_removes_key() {
        let store = MemoryObjectStore::new();
        store.set("x", b"y").unwrap();
        store.delete("x").unwrap();
        assert!(store.get("x").unwrap_err().is_not_found());
    }
}
