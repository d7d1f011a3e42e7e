//! Inode identity and the live node table.
//!
//! Inode numbers are derived from paths with a stable 64-bit hash, so the
//! same path always gets the same inode across lookups and across mounts
//! without any allocation table. Distinct paths that happen to hash equally
//! are indistinguishable to the kernel; at 64 bits that risk is accepted
//! rather than detected.
//!
//! [`NodeTable`] holds the nodes the kernel currently knows about, keyed by
//! inode, so repeated lookups of one path share one content buffer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

use crate::constants::ROOT_INODE;
use crate::hierarchy::child_prefix;
use crate::hierarchy::rebase;
use crate::node::VirtualNode;

/// Hash a path into an inode number.
///
/// Uses xxh3 (non-cryptographic, order-sensitive, full avalanche) over the
/// path bytes, shifting results away from the reserved inodes 0 and 1.
pub fn inode_number(path: &str) -> u64 {
    let inode = xxh3_64(path.as_bytes());
    if inode < 2 { inode.wrapping_add(2) } else { inode }
}

/// Inode for a node path; the root (empty path) is always [`ROOT_INODE`].
pub fn inode_for_path(path: &str) -> u64 {
    if path.is_empty() { ROOT_INODE } else { inode_number(path) }
}

struct NodeSlot {
    node: Arc<VirtualNode>,
    /// Outstanding kernel lookups; the slot is dropped when this reaches zero.
    lookups: u64,
    /// Set once the path was unlinked or renamed away. The node keeps serving
    /// open handles but is replaced by the next lookup of the same inode.
    /// A relocated node's path no longer hashes to its slot.
    stale: bool,
}

/// Arena of live nodes indexed by inode.
///
/// The root is inserted at construction and never forgotten.
pub struct NodeTable {
    slots: RwLock<HashMap<u64, NodeSlot>>,
}

impl NodeTable {
    /// Create a table holding only the root node.
    pub fn new(root: VirtualNode) -> Self {
        let mut slots = HashMap::new();
        slots.insert(ROOT_INODE, NodeSlot {
            node: Arc::new(root),
            lookups: 1,
            stale: false,
        });
        Self {
            slots: RwLock::new(slots),
        }
    }

    /// Node registered under `inode`.
    pub fn get(&self, inode: u64) -> Option<Arc<VirtualNode>> {
        self.slots.read().get(&inode).map(|slot| slot.node.clone())
    }

    /// Register a freshly looked-up node, counting one kernel lookup.
    ///
    /// A live node already registered for the same path and kind is kept, so
    /// its buffer stays the single working copy. Otherwise `node` takes the
    /// slot.
    pub fn remember(&self, node: VirtualNode) -> (u64, Arc<VirtualNode>) {
        let inode = inode_for_path(node.path());
        let mut slots = self.slots.write();

        if let Some(slot) = slots.get_mut(&inode) {
            slot.lookups += 1;
            let reusable =
                !slot.stale && slot.node.path() == node.path() && slot.node.is_leaf() == node.is_leaf();
            if reusable {
                return (inode, slot.node.clone());
            }
            if !slot.stale && slot.node.path() != node.path() {
                warn!(
                    inode,
                    existing = %slot.node.path(),
                    incoming = %node.path(),
                    "inode hash collision, replacing node"
                );
            }
            slot.node = Arc::new(node);
            slot.stale = false;
            return (inode, slot.node.clone());
        }

        let node = Arc::new(node);
        slots.insert(inode, NodeSlot {
            node: node.clone(),
            lookups: 1,
            stale: false,
        });
        (inode, node)
    }

    /// Install a node that was just created, replacing whatever held its inode.
    pub fn replace(&self, node: VirtualNode) -> (u64, Arc<VirtualNode>) {
        let inode = inode_for_path(node.path());
        let node = Arc::new(node);
        let mut slots = self.slots.write();
        let slot = slots.entry(inode).or_insert_with(|| NodeSlot {
            node: node.clone(),
            lookups: 0,
            stale: false,
        });
        slot.node = node.clone();
        slot.lookups += 1;
        slot.stale = false;
        (inode, node)
    }

    /// Detach the node at `path` from the tree.
    pub fn invalidate_path(&self, path: &str) {
        let inode = inode_for_path(path);
        if inode == ROOT_INODE {
            return;
        }
        if let Some(slot) = self.slots.write().get_mut(&inode)
            && slot.node.path() == path
        {
            slot.node.detach();
            slot.stale = true;
        }
    }

    /// Detach `path` and every registered node below it.
    pub fn invalidate_subtree(&self, path: &str) {
        let prefix = child_prefix(path);
        let mut slots = self.slots.write();
        for (inode, slot) in slots.iter_mut() {
            if *inode == ROOT_INODE {
                continue;
            }
            let node_path = slot.node.path();
            if node_path == path || node_path.starts_with(&prefix) {
                slot.node.detach();
                slot.stale = true;
            }
        }
    }

    /// Follow a rename of `from` to `to`.
    ///
    /// Every node at or below `from` keeps its slot, so the kernel's inode
    /// stays valid, but is swapped for a node at the rebased path carrying
    /// the same buffer. The old nodes are detached.
    pub fn relocate_subtree(&self, from: &str, to: &str) {
        let (from_prefix, to_prefix) = (child_prefix(from), child_prefix(to));
        let mut slots = self.slots.write();
        for (inode, slot) in slots.iter_mut() {
            if *inode == ROOT_INODE {
                continue;
            }
            let moved = if slot.node.path() == from {
                to.to_string()
            } else if let Some(moved) = rebase(slot.node.path(), &from_prefix, &to_prefix) {
                moved
            } else {
                continue;
            };
            debug!(inode, from = %slot.node.path(), to = %moved, "relocated node");
            slot.node = Arc::new(slot.node.relocate(moved));
            slot.stale = true;
        }
    }

    /// Drop `count` kernel lookups of `inode`, releasing the node at zero.
    pub fn forget(&self, inode: u64, count: u64) {
        if inode == ROOT_INODE {
            return;
        }
        let mut slots = self.slots.write();
        let Some(slot) = slots.get_mut(&inode) else {
            return;
        };
        slot.lookups = slot.lookups.saturating_sub(count);
        if slot.lookups == 0 {
            let slot = slots.remove(&inode);
            debug!(inode, path = ?slot.map(|s| s.node.path().to_string()), "forgot node");
        }
    }

    /// Number of registered nodes, root included.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether the table is empty (never true while the root is held).
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}
