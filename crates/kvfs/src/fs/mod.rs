//! FUSE filesystem adapter over [`VirtualNode`]s.
//!
//! Maps filesystem paths to store keys:
//! - `/myapp/config/db` -> key `/myapp/config/db`
//! - Directories are virtual (derived from key prefixes) or marked by an
//!   empty key ending in `/`
//! - File contents are the values, buffered per node until flush

mod operations;


use std::ffi::CStr;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use fuse_backend_rs::abi::fuse_abi::stat64;
use fuse_backend_rs::api::filesystem::Entry;

use crate::constants::ATTR_TTL;
use crate::constants::BLOCK_SIZE;
use crate::constants::ENTRY_TTL;
use crate::constants::ROOT_INODE;
use crate::inode::NodeTable;
use crate::node::NodeAttr;
use crate::node::Ownership;
use crate::node::VirtualNode;
use crate::store::InMemoryStore;
use crate::store::SharedStore;

/// Key-value backed FUSE filesystem.
///
/// Holds the live nodes the kernel has looked up; every node shares the one
/// store handle.
pub struct KvFs {
    /// Inode -> node arena, root pre-registered.
    nodes: NodeTable,
    store: SharedStore,
    owner: Ownership,
}

impl KvFs {
    /// Create a filesystem over `store`, reporting `owner` on every node.
    pub fn new(store: SharedStore, owner: Ownership) -> Self {
        let root = VirtualNode::root(store.clone(), owner);
        Self {
            nodes: NodeTable::new(root),
            store,
            owner,
        }
    }

    /// Create a filesystem over a fresh [`InMemoryStore`].
    pub fn new_in_memory(owner: Ownership) -> Self {
        Self::new(Arc::new(InMemoryStore::new()), owner)
    }

    /// The backing store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Owner reported for every node.
    pub fn owner(&self) -> Ownership {
        self.owner
    }

    /// Number of nodes currently known to the kernel, root included.
    pub fn live_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Node registered under `inode`, or `ENOENT`.
    fn node(&self, inode: u64) -> std::io::Result<Arc<VirtualNode>> {
        self.nodes.get(inode).ok_or_else(|| std::io::Error::from_raw_os_error(libc::ENOENT))
    }

    /// Node registered under `inode` that must be a directory.
    fn directory(&self, inode: u64) -> std::io::Result<Arc<VirtualNode>> {
        let node = self.node(inode)?;
        if node.is_leaf() {
            return Err(std::io::Error::from_raw_os_error(libc::ENOTDIR));
        }
        Ok(node)
    }

    /// Decode a path segment handed over by the kernel.
    fn name_str(name: &CStr) -> std::io::Result<&str> {
        name.to_str().map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))
    }

    /// Build a stat64 structure from node attributes.
    fn make_attr(attr: &NodeAttr) -> stat64 {
        let (atime, atime_nsec) = unix_time(attr.atime);
        let (mtime, mtime_nsec) = unix_time(attr.mtime);
        let (ctime, ctime_nsec) = unix_time(attr.ctime);

        // SAFETY: stat64 is a C struct that can be safely zero-initialized.
        // All fields are primitive types (integers) with no invariants.
        let mut st: stat64 = unsafe { std::mem::zeroed() };
        st.st_ino = attr.inode;
        st.st_mode = attr.mode;
        st.st_nlink = attr.nlink.into();
        st.st_uid = attr.uid;
        st.st_gid = attr.gid;
        st.st_size = attr.size as i64;
        st.st_blocks = attr.blocks as i64;
        st.st_blksize = i64::from(BLOCK_SIZE);
        st.st_atime = atime;
        st.st_atime_nsec = atime_nsec;
        st.st_mtime = mtime;
        st.st_mtime_nsec = mtime_nsec;
        st.st_ctime = ctime;
        st.st_ctime_nsec = ctime_nsec;
        st
    }

    /// Build an Entry for FUSE lookup responses.
    fn make_entry(node: &VirtualNode) -> Entry {
        let attr = node.getattr();
        Entry {
            inode: attr.inode,
            generation: 0,
            attr: Self::make_attr(&attr),
            attr_flags: 0,
            attr_timeout: ATTR_TTL,
            entry_timeout: ENTRY_TTL,
        }
    }

    /// Inode of the directory containing `node`; the root is its own parent.
    fn parent_inode(node: &VirtualNode) -> u64 {
        crate::hierarchy::split_parent(node.path())
            .map(|(parent, _)| crate::inode::inode_for_path(parent))
            .unwrap_or(ROOT_INODE)
    }
}

fn unix_time(time: SystemTime) -> (i64, i64) {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    (since.as_secs() as i64, i64::from(since.subsec_nanos()))
}
