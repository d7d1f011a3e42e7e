//! FUSE filesystem presenting a flat key-value store as a directory tree.
//!
//! Keys are absolute slash-separated paths. A key names a file and its value
//! is the file's content; directories exist wherever some key continues past
//! a separator, or where an empty marker key ending in `/` was written by
//! `mkdir`.
//!
//! # Key Mapping
//!
//! - `/myapp/config/db` -> key `/myapp/config/db`
//! - `/myapp` -> directory, because `/myapp/config/db` exists
//! - `/empty` created by mkdir -> marker key `/empty/`
//!
//! # Usage
//!
//! ```bash
//! # Mount the redb database at ./data.redb on /mnt/kv
//! kvfs /mnt/kv --path ./data.redb
//!
//! # Verbose logging, readable by other users
//! kvfs /mnt/kv -p ./data.redb -v --mount-options allow_other
//! ```
//!
//! File writes stay in memory until the kernel flushes the file (on close),
//! at which point the whole value is written back to the store.

pub mod config;
pub mod constants;
pub mod error;
pub mod fs;
pub mod hierarchy;
pub mod inode;
pub mod mount;
pub mod node;
pub mod store;

pub use config::MountConfig;
pub use config::MountOptions;
pub use error::Error;
pub use fs::KvFs;
pub use inode::NodeTable;
pub use inode::inode_number;
pub use mount::MountError;
pub use mount::MountSession;
pub use node::DirectoryEntry;
pub use node::EntryType;
pub use node::NodeAttr;
pub use node::Ownership;
pub use node::VirtualNode;
pub use store::InMemoryStore;
pub use store::KeyValueStore;
pub use store::RedbStore;
pub use store::SharedStore;
pub use store::StoreError;
