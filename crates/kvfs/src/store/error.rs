//! Error types for key-value store operations.

use std::path::PathBuf;

use snafu::Snafu;

/// Errors from [`KeyValueStore`](super::KeyValueStore) implementations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// Failed to open the redb database file.
    #[snafu(display("failed to open redb database at {}: {source}", path.display()))]
    OpenDatabase {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying database error.
        #[snafu(source(from(redb::DatabaseError, Box::new)))]
        source: Box<redb::DatabaseError>,
    },

    /// Failed to begin a read transaction.
    #[snafu(display("failed to begin read transaction: {source}"))]
    BeginRead {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
    },

    /// Failed to begin a write transaction.
    #[snafu(display("failed to begin write transaction: {source}"))]
    BeginWrite {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
    },

    /// Failed to open the key table.
    #[snafu(display("failed to open table: {source}"))]
    OpenTable {
        #[snafu(source(from(redb::TableError, Box::new)))]
        source: Box<redb::TableError>,
    },

    /// Failed to read a value.
    #[snafu(display("failed to get key {key:?}: {source}"))]
    Get {
        /// Key being read.
        key: String,
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    /// Failed to insert a value.
    #[snafu(display("failed to put key {key:?}: {source}"))]
    Insert {
        /// Key being written.
        key: String,
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    /// Failed to remove a value.
    #[snafu(display("failed to delete key {key:?}: {source}"))]
    Remove {
        /// Key being deleted.
        key: String,
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    /// Failed to iterate a key range.
    #[snafu(display("failed to scan prefix {prefix:?}: {source}"))]
    Range {
        /// Prefix being scanned.
        prefix: String,
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    /// Failed to commit a write transaction.
    #[snafu(display("failed to commit transaction: {source}"))]
    Commit {
        #[snafu(source(from(redb::CommitError, Box::new)))]
        source: Box<redb::CommitError>,
    },

    /// The store was closed and accepts no further operations.
    #[snafu(display("store is closed"))]
    Closed,
}
