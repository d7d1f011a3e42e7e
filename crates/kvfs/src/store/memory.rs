//! In-memory store backed by a `BTreeMap`.
//!
//! Used by tests and for ephemeral mounts. The map's ordering gives the
//! ascending scan order for free.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use super::KeyValueStore;
use super::StoreResult;

/// Thread-safe in-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `entries`.
    pub fn with_entries<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Vec<u8>>,
        I: IntoIterator<Item = (K, V)>,
    {
        let map = entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self {
            entries: RwLock::new(map),
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for InMemoryStore {
    fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let entries = self.entries.read();
        let keys = entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        Ok(keys)
    }

    fn get_value(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put_value(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete_key(&self, key: &str) -> StoreResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}
