//! Key-value store collaborator consumed by the filesystem core.
//!
//! The core only needs five operations: an ordered prefix scan, point
//! get/put/delete, and a one-time close at shutdown. Lookup classification
//! depends on [`KeyValueStore::list_keys`] returning keys in ascending
//! lexicographic order; every implementation here is tested against that
//! contract (see [`contract`] in test builds).

mod error;
mod memory;
mod redb_store;

use std::sync::Arc;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use redb_store::RedbStore;

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A flat string-keyed byte store.
///
/// Implementations must tolerate concurrent callers: every node of a mount
/// shares one handle.
pub trait KeyValueStore: Send + Sync {
    /// Every key starting with `prefix`, in ascending lexicographic order.
    fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// The value at `key`, or `None` when the key is absent.
    fn get_value(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Store `value` at `key`, replacing any previous value.
    fn put_value(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Remove `key`. Removing an absent key succeeds.
    fn delete_key(&self, key: &str) -> StoreResult<()>;

    /// Release the store. Called once at process shutdown.
    fn close(&self) -> StoreResult<()>;
}

/// Store handle shared by every node of a mount.
pub type SharedStore = Arc<dyn KeyValueStore>;
