//! Persistent store backed by a single redb table.
//!
//! redb keeps keys in a B-tree, so a range starting at the prefix walks keys
//! in ascending order and the scan stops at the first key outside it.

use std::path::Path;
use std::path::PathBuf;

use parking_lot::RwLock;
use redb::Database;
use redb::TableDefinition;
use snafu::OptionExt;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;

use super::KeyValueStore;
use super::StoreResult;
use super::error::BeginReadSnafu;
use super::error::BeginWriteSnafu;
use super::error::ClosedSnafu;
use super::error::CommitSnafu;
use super::error::GetSnafu;
use super::error::InsertSnafu;
use super::error::OpenDatabaseSnafu;
use super::error::OpenTableSnafu;
use super::error::RangeSnafu;
use super::error::RemoveSnafu;
use crate::constants::REDB_TABLE_NAME;

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new(REDB_TABLE_NAME);

/// [`KeyValueStore`] persisted in a redb database file.
pub struct RedbStore {
    /// `None` once [`KeyValueStore::close`] has run.
    db: RwLock<Option<Database>>,
    path: PathBuf,
}

impl RedbStore {
    /// Open (or create) the database at `path` and make sure the key table exists.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).context(OpenDatabaseSnafu { path: &path })?;

        // Read transactions fail on a missing table, so create it up front.
        let txn = db.begin_write().context(BeginWriteSnafu)?;
        txn.open_table(KV_TABLE).context(OpenTableSnafu)?;
        txn.commit().context(CommitSnafu)?;

        info!(path = %path.display(), "opened redb store");
        Ok(Self {
            db: RwLock::new(Some(db)),
            path,
        })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for RedbStore {
    fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let guard = self.db.read();
        let db = guard.as_ref().context(ClosedSnafu)?;
        let txn = db.begin_read().context(BeginReadSnafu)?;
        let table = txn.open_table(KV_TABLE).context(OpenTableSnafu)?;

        let mut keys = Vec::new();
        for entry in table.range(prefix..).context(RangeSnafu { prefix })? {
            let (key, _) = entry.context(RangeSnafu { prefix })?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        debug!(prefix, count = keys.len(), "scanned keys");
        Ok(keys)
    }

    fn get_value(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let guard = self.db.read();
        let db = guard.as_ref().context(ClosedSnafu)?;
        let txn = db.begin_read().context(BeginReadSnafu)?;
        let table = txn.open_table(KV_TABLE).context(OpenTableSnafu)?;
        let value = table.get(key).context(GetSnafu { key })?.map(|v| v.value().to_vec());
        Ok(value)
    }

    fn put_value(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let guard = self.db.read();
        let db = guard.as_ref().context(ClosedSnafu)?;
        let txn = db.begin_write().context(BeginWriteSnafu)?;
        {
            let mut table = txn.open_table(KV_TABLE).context(OpenTableSnafu)?;
            table.insert(key, value).context(InsertSnafu { key })?;
        }
        txn.commit().context(CommitSnafu)?;
        Ok(())
    }

    fn delete_key(&self, key: &str) -> StoreResult<()> {
        let guard = self.db.read();
        let db = guard.as_ref().context(ClosedSnafu)?;
        let txn = db.begin_write().context(BeginWriteSnafu)?;
        {
            let mut table = txn.open_table(KV_TABLE).context(OpenTableSnafu)?;
            table.remove(key).context(RemoveSnafu { key })?;
        }
        txn.commit().context(CommitSnafu)?;
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        let db = self.db.write().take().context(ClosedSnafu)?;
        drop(db);
        info!(path = %self.path.display(), "closed redb store");
        Ok(())
    }
}
