//! Filesystem nodes backed by store keys.
//!
//! A [`VirtualNode`] is one resolved path. Directory operations (lookup,
//! readdir, create, mkdir, unlink, rmdir, rename) go straight to the store.
//! File content is loaded into a private buffer on open, served from it on
//! read/write, and written back to the store only on flush.
//!
//! # Locking
//!
//! One `RwLock` guards the buffer. Reads share it; writes, resizes and
//! flush hold it exclusively, so a flush always persists a buffer no writer
//! is halfway through.
//!
//! # Detached nodes
//!
//! Once its path is unlinked or renamed away a node is detached: it keeps
//! serving reads and writes from its buffer but never persists again, so a
//! late flush cannot resurrect the old key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use parking_lot::RwLock;
use snafu::ResultExt;
use snafu::ensure;
use tracing::debug;
use tracing::error;

use crate::constants::BLOCK_SIZE;
use crate::constants::DEFAULT_DIR_MODE;
use crate::constants::DEFAULT_FILE_MODE;
use crate::constants::MAX_FILE_SIZE;
use crate::error::Error;
use crate::error::FileTooLargeSnafu;
use crate::error::IsADirectorySnafu;
use crate::error::NotADirectorySnafu;
use crate::error::NotEmptySnafu;
use crate::error::NotFoundSnafu;
use crate::error::OutOfSpaceSnafu;
use crate::error::Result;
use crate::error::StoreSnafu;
use crate::hierarchy::child_prefix;
use crate::hierarchy::directory_marker;
use crate::hierarchy::next_hierarchy_level;
use crate::hierarchy::rebase;
use crate::hierarchy::resolve;
use crate::inode::inode_for_path;
use crate::store::SharedStore;
use crate::store::StoreResult;

/// Owner reported for every node: the mounting process's real uid/gid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Real user and group of the current process.
    pub fn current() -> Self {
        // SAFETY: getuid() and getgid() are POSIX syscalls that return the real
        // user/group ID. They have no preconditions and cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self { uid, gid }
    }
}

/// Entry type for filesystem nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryType {
    /// Regular file (leaf node).
    File,
    /// Directory (can have children).
    Directory,
}

impl EntryType {
    fn from_leaf(is_leaf: bool) -> Self {
        if is_leaf { EntryType::File } else { EntryType::Directory }
    }

    /// Full mode: fixed permission bits plus the file-type bit.
    pub fn mode(self) -> u32 {
        match self {
            EntryType::File => DEFAULT_FILE_MODE,
            EntryType::Directory => DEFAULT_DIR_MODE,
        }
    }

    /// `d_type` value for directory listings.
    pub fn dirent_type(self) -> u32 {
        match self {
            EntryType::File => u32::from(libc::DT_REG),
            EntryType::Directory => u32::from(libc::DT_DIR),
        }
    }

    fn nlink(self) -> u32 {
        match self {
            EntryType::File => 1,
            EntryType::Directory => 2,
        }
    }
}

/// One child produced by [`VirtualNode::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub entry_type: EntryType,
    pub inode: u64,
}

impl DirectoryEntry {
    pub fn is_leaf(&self) -> bool {
        self.entry_type == EntryType::File
    }
}

/// Synthesized attributes of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub inode: u64,
    pub entry_type: EntryType,
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub blocks: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// A path in the tree, classified as file or directory when created.
pub struct VirtualNode {
    path: String,
    is_leaf: bool,
    store: SharedStore,
    owner: Ownership,
    /// Working copy of the value; `None` until the node is opened.
    content: RwLock<Option<Vec<u8>>>,
    /// Set under the content lock, so no persist races it.
    detached: AtomicBool,
}

impl fmt::Debug for VirtualNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualNode")
            .field("path", &self.path)
            .field("is_leaf", &self.is_leaf)
            .field("loaded", &self.content.read().as_ref().map(Vec::len))
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Wrap a store result with the path it served, logging failures.
fn logged<T>(path: &str, op: &'static str, result: StoreResult<T>) -> Result<T> {
    result.inspect_err(|e| error!(path, op, error = %e, "store operation failed")).context(StoreSnafu { path })
}

/// Resize `buf` to `len`, zero-filling growth. Allocation failure is an
/// error rather than an abort.
fn resize_buffer(path: &str, buf: &mut Vec<u8>, len: usize) -> Result<()> {
    if len > buf.len() {
        buf.try_reserve_exact(len - buf.len()).context(OutOfSpaceSnafu { path })?;
    }
    buf.resize(len, 0);
    Ok(())
}

impl VirtualNode {
    /// Create a node for `path`. The classification is fixed for its lifetime.
    pub fn new(path: impl Into<String>, is_leaf: bool, store: SharedStore, owner: Ownership) -> Self {
        Self {
            path: path.into(),
            is_leaf,
            store,
            owner,
            content: RwLock::new(None),
            detached: AtomicBool::new(false),
        }
    }

    /// The root directory (empty path).
    pub fn root(store: SharedStore, owner: Ownership) -> Self {
        Self::new(String::new(), false, store, owner)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn entry_type(&self) -> EntryType {
        EntryType::from_leaf(self.is_leaf)
    }

    pub fn inode(&self) -> u64 {
        inode_for_path(&self.path)
    }

    /// Whether the content buffer has been populated.
    pub fn is_open(&self) -> bool {
        self.content.read().is_some()
    }

    /// Whether the node's path was removed or moved out from under it.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Stop persisting this node. The buffer stays readable and writable.
    pub fn detach(&self) {
        let _content = self.content.write();
        self.detached.store(true, Ordering::Release);
    }

    /// Hand this node's buffer to a new node at `path` and detach this one.
    ///
    /// Used when a rename moves the key: writes that arrive through the old
    /// inode keep landing in the buffer that flushes to the new key.
    pub fn relocate(&self, path: impl Into<String>) -> VirtualNode {
        let mut content = self.content.write();
        self.detached.store(true, Ordering::Release);
        let moved = self.child(path.into(), self.is_leaf);
        *moved.content.write() = content.take();
        moved
    }

    fn child(&self, path: String, is_leaf: bool) -> VirtualNode {
        VirtualNode::new(path, is_leaf, self.store.clone(), self.owner)
    }

    fn ensure_directory(&self) -> Result<()> {
        if self.is_leaf {
            return NotADirectorySnafu { path: &self.path }.fail();
        }
        Ok(())
    }

    /// Find `name` under this directory.
    ///
    /// Scans keys starting with the child path. An exact key makes the child
    /// a file; otherwise any key continuing with a separator makes it a
    /// directory. The exact key, when present, sorts first because it is a
    /// prefix of every other scanned key.
    pub fn lookup(&self, name: &str) -> Result<VirtualNode> {
        self.ensure_directory()?;
        let path = resolve(&self.path, name);
        debug!(path = %path, "lookup");

        let keys = logged(&path, "lookup", self.store.list_keys(&path))?;
        let Some(first) = keys.first() else {
            return NotFoundSnafu { path }.fail();
        };

        if *first == path {
            return Ok(self.child(path, true));
        }
        // Siblings like `/dir-x` sort before `/dir/`, so check every key.
        let prefix = child_prefix(&path);
        if keys.iter().any(|key| key.starts_with(&prefix)) {
            return Ok(self.child(path, false));
        }
        NotFoundSnafu { path }.fail()
    }

    /// List the immediate children of this directory.
    ///
    /// A name that is both an exact key and the prefix of deeper keys is
    /// listed as a file, matching what [`lookup`](Self::lookup) reports.
    pub fn readdir(&self) -> Result<Vec<DirectoryEntry>> {
        self.ensure_directory()?;
        let prefix = child_prefix(&self.path);
        debug!(path = %self.path, "readdir");

        let keys = logged(&self.path, "readdir", self.store.list_keys(&prefix))?;

        let mut children: BTreeMap<&str, EntryType> = BTreeMap::new();
        for key in &keys {
            let Some((segment, has_deeper)) = next_hierarchy_level(key, &prefix) else {
                continue;
            };
            let entry_type = EntryType::from_leaf(!has_deeper);
            children
                .entry(segment)
                .and_modify(|existing| *existing = (*existing).min(entry_type))
                .or_insert(entry_type);
        }

        Ok(children
            .into_iter()
            .map(|(name, entry_type)| DirectoryEntry {
                inode: inode_for_path(&resolve(&self.path, name)),
                name: name.to_string(),
                entry_type,
            })
            .collect())
    }

    /// Load the current value into the buffer. No-op once loaded.
    ///
    /// An absent key loads as an empty buffer.
    pub fn open(&self) -> Result<()> {
        if !self.is_leaf {
            return IsADirectorySnafu { path: &self.path }.fail();
        }
        if self.is_open() {
            return Ok(());
        }

        let value = logged(&self.path, "open", self.store.get_value(&self.path))?.unwrap_or_default();
        let mut content = self.content.write();
        // A concurrent open may have won while the store was read.
        let length = content.get_or_insert(value).len();
        debug!(path = %self.path, length, "open");
        Ok(())
    }

    /// Bytes `[offset, offset + length)` clamped to the buffer.
    ///
    /// Out-of-range offsets and unopened nodes read as empty.
    pub fn read(&self, offset: u64, length: usize) -> Vec<u8> {
        let content = self.content.read();
        let Some(buf) = content.as_ref() else {
            return Vec::new();
        };
        let start = offset as usize;
        if start >= buf.len() {
            return Vec::new();
        }
        let end = start.saturating_add(length).min(buf.len());
        debug!(path = %self.path, offset, length = end - start, "read");
        buf[start..end].to_vec()
    }

    /// Copy `data` into the buffer at `offset`, zero-filling any gap.
    ///
    /// Returns the number of bytes written; the store is untouched until flush.
    /// Fails with [`Error::FileTooLarge`] if the write would end past
    /// [`MAX_FILE_SIZE`].
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let requested = offset.saturating_add(data.len() as u64);
        ensure!(requested <= MAX_FILE_SIZE, FileTooLargeSnafu {
            path: &self.path,
            size: requested,
        });
        // Both bounds fit in usize: MAX_FILE_SIZE <= isize::MAX.
        let (start, end) = (offset as usize, requested as usize);

        let mut content = self.content.write();
        let buf = content.get_or_insert_with(Vec::new);
        if end > buf.len() {
            resize_buffer(&self.path, buf, end)?;
        }
        buf[start..end].copy_from_slice(data);
        debug!(path = %self.path, offset, length = data.len(), "write");
        Ok(data.len())
    }

    /// Persist the buffer at the node's key.
    ///
    /// A failed put leaves the buffer as it was, so flushing again resends it.
    /// Directories and unopened files have nothing to persist.
    pub fn flush(&self) -> Result<()> {
        if !self.is_leaf {
            return Ok(());
        }
        let content = self.content.write();
        let Some(buf) = content.as_ref() else {
            return Ok(());
        };
        self.persist(buf)
    }

    /// Callers hold the content lock.
    fn persist(&self, buf: &[u8]) -> Result<()> {
        if self.is_detached() {
            debug!(path = %self.path, length = buf.len(), "detached, skipping flush");
            return Ok(());
        }
        debug!(path = %self.path, length = buf.len(), "flush");
        logged(&self.path, "flush", self.store.put_value(&self.path, buf))
    }

    /// Durability is the store's concern once flush has run.
    pub fn fsync(&self) -> Result<()> {
        debug!(path = %self.path, "fsync");
        Ok(())
    }

    /// Create an empty file `name` and persist its placeholder key.
    pub fn create(&self, name: &str) -> Result<VirtualNode> {
        self.ensure_directory()?;
        let child = self.child(resolve(&self.path, name), true);
        debug!(path = %child.path, "create");
        *child.content.write() = Some(Vec::new());
        child.flush()?;
        Ok(child)
    }

    /// Create directory `name` by persisting its marker key.
    pub fn mkdir(&self, name: &str) -> Result<VirtualNode> {
        self.ensure_directory()?;
        let path = resolve(&self.path, name);
        let marker = directory_marker(&path);
        debug!(path = %path, marker = %marker, "mkdir");
        logged(&path, "mkdir", self.store.put_value(&marker, &[]))?;
        Ok(self.child(path, false))
    }

    /// Delete the key for file `name`. Deleting a missing key succeeds.
    pub fn unlink(&self, name: &str) -> Result<()> {
        self.ensure_directory()?;
        let path = resolve(&self.path, name);
        debug!(path = %path, "unlink");
        logged(&path, "unlink", self.store.delete_key(&path))
    }

    /// Remove directory `name`, which may hold nothing but its own marker.
    pub fn rmdir(&self, name: &str) -> Result<()> {
        self.ensure_directory()?;
        let path = resolve(&self.path, name);
        let prefix = child_prefix(&path);
        debug!(path = %path, "rmdir");

        let keys = logged(&path, "rmdir", self.store.list_keys(&prefix))?;
        if keys.iter().any(|key| *key != prefix) {
            return NotEmptySnafu { path }.fail();
        }
        logged(&path, "rmdir", self.store.delete_key(&prefix))
    }

    /// Move child `name` to `new_name` under `new_parent`.
    ///
    /// Files are copied then deleted; directories move every key under their
    /// prefix. Keys move one at a time, so a failure midway leaves the entry
    /// partly at both locations.
    ///
    /// An existing target must be the same kind as the source: a file cannot
    /// replace a directory (`IsADirectory`) nor a directory a file
    /// (`NotADirectory`). A directory may only replace an empty directory.
    pub fn rename(&self, name: &str, new_parent: &VirtualNode, new_name: &str) -> Result<EntryType> {
        new_parent.ensure_directory()?;
        let source = self.lookup(name)?;
        let target = resolve(&new_parent.path, new_name);
        debug!(from = %source.path, to = %target, "rename");

        if source.path == target {
            return Ok(source.entry_type());
        }

        match new_parent.lookup(new_name) {
            Ok(existing) if source.is_leaf && !existing.is_leaf => {
                return IsADirectorySnafu { path: target }.fail();
            }
            Ok(existing) if !source.is_leaf && existing.is_leaf => {
                return NotADirectorySnafu { path: target }.fail();
            }
            Ok(_) | Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        if source.is_leaf {
            let value = logged(&source.path, "rename", self.store.get_value(&source.path))?.unwrap_or_default();
            logged(&target, "rename", self.store.put_value(&target, &value))?;
            logged(&source.path, "rename", self.store.delete_key(&source.path))?;
            return Ok(EntryType::File);
        }

        let old_prefix = child_prefix(&source.path);
        let new_prefix = child_prefix(&target);
        let occupied = logged(&target, "rename", self.store.list_keys(&new_prefix))?;
        if occupied.iter().any(|key| *key != new_prefix) {
            return NotEmptySnafu { path: target }.fail();
        }
        // Replacing an empty directory: drop its marker, the source brings its own keys.
        if !occupied.is_empty() {
            logged(&target, "rename", self.store.delete_key(&new_prefix))?;
        }

        for key in logged(&source.path, "rename", self.store.list_keys(&old_prefix))? {
            let Some(new_key) = rebase(&key, &old_prefix, &new_prefix) else {
                continue;
            };
            let Some(value) = logged(&key, "rename", self.store.get_value(&key))? else {
                continue;
            };
            logged(&new_key, "rename", self.store.put_value(&new_key, &value))?;
            logged(&key, "rename", self.store.delete_key(&key))?;
        }
        Ok(EntryType::Directory)
    }

    /// Current attributes. Size is the buffer length (0 until opened) and
    /// every timestamp is the time of the call.
    pub fn getattr(&self) -> NodeAttr {
        let entry_type = self.entry_type();
        let size = self.content.read().as_ref().map_or(0, |buf| buf.len() as u64);
        let now = SystemTime::now();
        NodeAttr {
            inode: self.inode(),
            entry_type,
            mode: entry_type.mode(),
            size,
            nlink: entry_type.nlink(),
            blocks: size.div_ceil(u64::from(BLOCK_SIZE)),
            uid: self.owner.uid,
            gid: self.owner.gid,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// Apply a truncate/extend and persist it. Only size is honored.
    ///
    /// The current value is loaded first, so truncating a file that was
    /// never opened keeps its leading bytes. Sizes past [`MAX_FILE_SIZE`]
    /// fail with [`Error::FileTooLarge`] and leave the buffer alone.
    pub fn setattr(&self, size: Option<u64>) -> Result<NodeAttr> {
        if let Some(size) = size
            && self.is_leaf
        {
            ensure!(size <= MAX_FILE_SIZE, FileTooLargeSnafu { path: &self.path, size });
            self.open()?;
            let mut content = self.content.write();
            let buf = content.get_or_insert_with(Vec::new);
            resize_buffer(&self.path, buf, size as usize)?;
            debug!(path = %self.path, size, "setattr resize");
            self.persist(buf)?;
        }
        Ok(self.getattr())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::InMemoryStore;
    use crate::store::KeyValueStore;
    use crate::store::StoreError;

    const OWNER: Ownership = Ownership { uid: 1000, gid: 100 };

    fn store_with(keys: &[(&str, &str)]) -> SharedStore {
        Arc::new(InMemoryStore::with_entries(keys.iter().copied()))
    }

    fn root(store: &SharedStore) -> VirtualNode {
        VirtualNode::root(store.clone(), OWNER)
    }

    /// Store whose writes can be switched off to exercise failure paths.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryStore,
        fail_writes: AtomicBool,
    }

    impl KeyValueStore for FlakyStore {
        fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
            self.inner.list_keys(prefix)
        }

        fn get_value(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
            self.inner.get_value(key)
        }

        fn put_value(&self, key: &str, value: &[u8]) -> StoreResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Closed);
            }
            self.inner.put_value(key, value)
        }

        fn delete_key(&self, key: &str) -> StoreResult<()> {
            self.inner.delete_key(key)
        }

        fn close(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_lookup_classifies_file_and_directory() {
        let store = store_with(&[("/a", "x"), ("/b/c", ""), ("/b/d", "")]);
        let root = root(&store);

        assert!(root.lookup("a").unwrap().is_leaf());
        let b = root.lookup("b").unwrap();
        assert!(!b.is_leaf());
        assert_eq!(b.path(), "/b");
        assert!(matches!(root.lookup("z"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_lookup_directory_despite_sorted_sibling() {
        // "/b-x" sorts before "/b/c"
        let store = store_with(&[("/b-x", ""), ("/b/c", "")]);
        let root = root(&store);
        assert!(!root.lookup("b").unwrap().is_leaf());
        assert!(root.lookup("b-x").unwrap().is_leaf());
    }

    #[test]
    fn test_lookup_prefix_only_is_not_found() {
        let store = store_with(&[("/abc", "")]);
        assert!(matches!(root(&store).lookup("ab"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_lookup_under_file_fails() {
        let store = store_with(&[("/a", "")]);
        let a = root(&store).lookup("a").unwrap();
        assert!(matches!(a.lookup("x"), Err(Error::NotADirectory { .. })));
    }

    #[test]
    fn test_readdir_derives_hierarchy() {
        let store = store_with(&[("/a", ""), ("/b/c", ""), ("/b/d", "")]);
        let root = root(&store);

        let entries = root.readdir().unwrap();
        let names: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.is_leaf())).collect();
        assert_eq!(names, vec![("a", true), ("b", false)]);

        let b = root.lookup("b").unwrap();
        let entries = b.readdir().unwrap();
        let names: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.is_leaf())).collect();
        assert_eq!(names, vec![("c", true), ("d", true)]);
        assert_eq!(entries[0].inode, inode_for_path("/b/c"));
    }

    #[test]
    fn test_readdir_leaf_wins_conflict() {
        let store = store_with(&[("/a", "file"), ("/a/nested", "")]);
        let root = root(&store);

        let entries = root.readdir().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::File);
        // Lookup agrees with the listing
        assert!(root.lookup("a").unwrap().is_leaf());
    }

    #[test]
    fn test_mkdir_marker_listing() {
        let store = store_with(&[]);
        let root = root(&store);

        let docs = root.mkdir("docs").unwrap();
        assert!(!docs.is_leaf());
        assert_eq!(store.get_value("/docs/").unwrap(), Some(Vec::new()));

        let entries = root.readdir().unwrap();
        assert_eq!(entries[0].name, "docs");
        assert_eq!(entries[0].entry_type, EntryType::Directory);

        // The marker itself is not an entry of the new directory
        assert!(docs.readdir().unwrap().is_empty());
        assert!(!root.lookup("docs").unwrap().is_leaf());
    }

    #[test]
    fn test_open_is_idempotent() {
        let store = store_with(&[("/a", "hello")]);
        let a = root(&store).lookup("a").unwrap();

        a.open().unwrap();
        let first = a.read(0, 64);
        // Changes in the store are not picked up by a second open
        store.put_value("/a", b"changed").unwrap();
        a.open().unwrap();
        assert_eq!(a.read(0, 64), first);
        assert_eq!(first, b"hello");
    }

    #[test]
    fn test_open_missing_key_is_empty() {
        let store = store_with(&[]);
        let node = VirtualNode::new("/ghost", true, store.clone(), OWNER);
        node.open().unwrap();
        assert!(node.is_open());
        assert!(node.read(0, 16).is_empty());
    }

    #[test]
    fn test_open_directory_fails() {
        let store = store_with(&[("/b/c", "")]);
        let b = root(&store).lookup("b").unwrap();
        assert!(matches!(b.open(), Err(Error::IsADirectory { .. })));
    }

    #[test]
    fn test_read_clamps_range() {
        let store = store_with(&[("/a", "0123456789")]);
        let a = root(&store).lookup("a").unwrap();
        a.open().unwrap();

        assert_eq!(a.read(2, 3), b"234");
        assert_eq!(a.read(8, 100), b"89");
        assert!(a.read(10, 4).is_empty());
        assert!(a.read(1000, 4).is_empty());
    }

    #[test]
    fn test_write_grows_with_zero_fill() {
        let store = store_with(&[("/a", "ab")]);
        let a = root(&store).lookup("a").unwrap();
        a.open().unwrap();

        assert_eq!(a.write(5, b"xyz").unwrap(), 3);
        assert_eq!(a.read(0, 64), b"ab\0\0\0xyz");

        assert_eq!(a.write(1, b"B").unwrap(), 1);
        assert_eq!(a.read(0, 2), b"aB");
    }

    #[test]
    fn test_write_past_max_file_size_fails() {
        let store = store_with(&[("/a", "ab")]);
        let a = root(&store).lookup("a").unwrap();
        a.open().unwrap();

        let err = a.write(u64::MAX - 1, b"xy").unwrap_err();
        assert!(matches!(err, Error::FileTooLarge { size: u64::MAX, .. }));
        assert_eq!(std::io::Error::from(err).raw_os_error(), Some(libc::EFBIG));
        assert!(matches!(a.write(MAX_FILE_SIZE, b"x"), Err(Error::FileTooLarge { .. })));
        assert_eq!(a.read(0, 64), b"ab");
    }

    #[test]
    fn test_write_does_not_touch_store_until_flush() {
        let store = store_with(&[("/a", "old")]);
        let a = root(&store).lookup("a").unwrap();
        a.open().unwrap();
        a.write(0, b"new").unwrap();
        assert_eq!(store.get_value("/a").unwrap().as_deref(), Some(&b"old"[..]));

        a.flush().unwrap();
        assert_eq!(store.get_value("/a").unwrap().as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn test_flush_survives_fresh_node() {
        let store = store_with(&[]);
        let created = root(&store).create("notes").unwrap();
        created.write(0, b"durable").unwrap();
        created.flush().unwrap();

        // Simulated restart: new nodes, same store
        let reopened = root(&store).lookup("notes").unwrap();
        reopened.open().unwrap();
        assert_eq!(reopened.read(0, 64), b"durable");
    }

    #[test]
    fn test_flush_failure_keeps_buffer() {
        let flaky = Arc::new(FlakyStore::default());
        let store: SharedStore = flaky.clone();
        let node = VirtualNode::new("/f", true, store.clone(), OWNER);
        node.open().unwrap();
        node.write(0, b"pending").unwrap();

        flaky.fail_writes.store(true, Ordering::SeqCst);
        let err = node.flush().unwrap_err();
        assert!(matches!(err, Error::Store { .. }));
        assert_eq!(std::io::Error::from(err).raw_os_error(), Some(libc::EIO));
        assert_eq!(node.read(0, 64), b"pending");

        flaky.fail_writes.store(false, Ordering::SeqCst);
        node.flush().unwrap();
        assert_eq!(store.get_value("/f").unwrap().as_deref(), Some(&b"pending"[..]));
    }

    #[test]
    fn test_flush_unopened_is_noop() {
        let store = store_with(&[("/a", "keep")]);
        let a = root(&store).lookup("a").unwrap();
        a.flush().unwrap();
        assert_eq!(store.get_value("/a").unwrap().as_deref(), Some(&b"keep"[..]));
    }

    #[test]
    fn test_create_persists_placeholder() {
        let store = store_with(&[]);
        let node = root(&store).create("new").unwrap();
        assert!(node.is_leaf());
        assert!(node.is_open());
        assert_eq!(store.get_value("/new").unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_create_failure_reports_io() {
        let flaky = Arc::new(FlakyStore::default());
        flaky.fail_writes.store(true, Ordering::SeqCst);
        let root = VirtualNode::root(flaky.clone(), OWNER);
        assert!(matches!(root.create("x"), Err(Error::Store { .. })));
    }

    #[test]
    fn test_unlink_removes_visibility() {
        let store = store_with(&[("/a", ""), ("/b/c", "")]);
        let root = root(&store);

        root.unlink("a").unwrap();
        assert!(matches!(root.lookup("a"), Err(Error::NotFound { .. })));
        let names: Vec<_> = root.readdir().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b"]);

        // Idempotent
        root.unlink("a").unwrap();
    }

    #[test]
    fn test_unlink_keeps_open_buffers() {
        let store = store_with(&[("/a", "data")]);
        let root = root(&store);
        let a = root.lookup("a").unwrap();
        a.open().unwrap();
        root.unlink("a").unwrap();
        assert_eq!(a.read(0, 64), b"data");
    }

    #[test]
    fn test_detached_node_never_persists() {
        let store = store_with(&[("/a", "data")]);
        let root = root(&store);
        let a = root.lookup("a").unwrap();
        a.open().unwrap();
        root.unlink("a").unwrap();
        a.detach();

        a.write(0, b"late").unwrap();
        a.flush().unwrap();
        a.setattr(Some(2)).unwrap();
        assert_eq!(a.read(0, 64), b"la");
        assert_eq!(store.get_value("/a").unwrap(), None);
    }

    #[test]
    fn test_relocate_carries_buffer() {
        let store = store_with(&[("/a", "orig")]);
        let a = root(&store).lookup("a").unwrap();
        a.open().unwrap();

        let b = a.relocate("/b");
        assert!(a.is_detached());
        assert!(!a.is_open());
        assert_eq!(b.path(), "/b");
        assert_eq!(b.read(0, 64), b"orig");

        b.write(0, b"NEW!").unwrap();
        b.flush().unwrap();
        a.flush().unwrap();
        assert_eq!(store.get_value("/b").unwrap().as_deref(), Some(&b"NEW!"[..]));
        assert_eq!(store.get_value("/a").unwrap().as_deref(), Some(&b"orig"[..]));
    }

    #[test]
    fn test_rmdir() {
        let store = store_with(&[("/full/x", "")]);
        let root = root(&store);
        root.mkdir("empty").unwrap();

        assert!(matches!(root.rmdir("full"), Err(Error::NotEmpty { .. })));
        root.rmdir("empty").unwrap();
        assert!(matches!(root.lookup("empty"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_rename_file() {
        let store = store_with(&[("/a", "payload"), ("/dir/", "")]);
        let root = root(&store);
        let dir = root.lookup("dir").unwrap();

        assert_eq!(root.rename("a", &dir, "b").unwrap(), EntryType::File);
        assert_eq!(store.get_value("/a").unwrap(), None);
        assert_eq!(store.get_value("/dir/b").unwrap().as_deref(), Some(&b"payload"[..]));
    }

    #[test]
    fn test_rename_directory_moves_subtree() {
        let store = store_with(&[("/old/", ""), ("/old/x", "1"), ("/old/sub/y", "2")]);
        let root = root(&store);

        assert_eq!(root.rename("old", &root, "new").unwrap(), EntryType::Directory);
        assert!(store.list_keys("/old").unwrap().is_empty());
        assert_eq!(store.list_keys("/new/").unwrap(), vec!["/new/", "/new/sub/y", "/new/x"]);
    }

    #[test]
    fn test_rename_onto_non_empty_directory() {
        let store = store_with(&[("/a/x", ""), ("/b/y", "")]);
        let root = root(&store);
        assert!(matches!(root.rename("a", &root, "b"), Err(Error::NotEmpty { .. })));
    }

    #[test]
    fn test_rename_file_onto_directory() {
        let store = store_with(&[("/f", "x"), ("/d/child", "y")]);
        let root = root(&store);

        let err = root.rename("f", &root, "d").unwrap_err();
        assert!(matches!(err, Error::IsADirectory { .. }));
        assert_eq!(std::io::Error::from(err).raw_os_error(), Some(libc::EISDIR));
        assert_eq!(store.list_keys("/").unwrap(), vec!["/d/child", "/f"]);

        // Empty directories are not replaced by files either
        root.mkdir("empty").unwrap();
        assert!(matches!(root.rename("f", &root, "empty"), Err(Error::IsADirectory { .. })));
        assert!(!root.lookup("d").unwrap().is_leaf());
    }

    #[test]
    fn test_rename_directory_onto_file() {
        let store = store_with(&[("/src/x", "1"), ("/f", "")]);
        let root = root(&store);

        let err = root.rename("src", &root, "f").unwrap_err();
        assert!(matches!(err, Error::NotADirectory { .. }));
        assert_eq!(std::io::Error::from(err).raw_os_error(), Some(libc::ENOTDIR));
        assert_eq!(store.list_keys("/").unwrap(), vec!["/f", "/src/x"]);
    }

    #[test]
    fn test_rename_directory_replaces_empty_directory() {
        let store = store_with(&[("/src/x", "1"), ("/dst/", "")]);
        let root = root(&store);

        assert_eq!(root.rename("src", &root, "dst").unwrap(), EntryType::Directory);
        assert_eq!(store.list_keys("/").unwrap(), vec!["/dst/x"]);
    }

    #[test]
    fn test_rename_file_replaces_file() {
        let store = store_with(&[("/a", "new"), ("/b", "old")]);
        let root = root(&store);

        root.rename("a", &root, "b").unwrap();
        assert_eq!(store.list_keys("/").unwrap(), vec!["/b"]);
        assert_eq!(store.get_value("/b").unwrap().as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn test_getattr() {
        let store = store_with(&[("/a", "12345")]);
        let root = root(&store);

        let attr = root.getattr();
        assert_eq!(attr.mode, libc::S_IFDIR | 0o755);
        assert_eq!(attr.inode, crate::constants::ROOT_INODE);
        assert_eq!(attr.nlink, 2);

        let a = root.lookup("a").unwrap();
        assert_eq!(a.getattr().size, 0);
        a.open().unwrap();
        let attr = a.getattr();
        assert_eq!(attr.mode, libc::S_IFREG | 0o644);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.blocks, 1);
        assert_eq!((attr.uid, attr.gid), (1000, 100));
    }

    #[test]
    fn test_setattr_shrink_is_durable() {
        let store = store_with(&[("/a", "0123456789")]);
        let a = root(&store).lookup("a").unwrap();

        // Never opened: existing bytes are loaded before truncating
        let attr = a.setattr(Some(4)).unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(store.get_value("/a").unwrap().as_deref(), Some(&b"0123"[..]));
    }

    #[test]
    fn test_setattr_grow_reads_zeros() {
        let store = store_with(&[("/a", "ab")]);
        let a = root(&store).lookup("a").unwrap();
        a.open().unwrap();

        a.setattr(Some(5)).unwrap();
        assert_eq!(a.read(0, 64), b"ab\0\0\0");
        assert_eq!(store.get_value("/a").unwrap().as_deref(), Some(&b"ab\0\0\0"[..]));
    }

    #[test]
    fn test_setattr_past_max_file_size_fails() {
        let store = store_with(&[("/a", "keep")]);
        let a = root(&store).lookup("a").unwrap();

        let err = a.setattr(Some(1 << 62)).unwrap_err();
        assert!(matches!(err, Error::FileTooLarge { .. }));
        assert_eq!(std::io::Error::from(err).raw_os_error(), Some(libc::EFBIG));
        assert!(matches!(a.setattr(Some(MAX_FILE_SIZE + 1)), Err(Error::FileTooLarge { .. })));
        assert_eq!(store.get_value("/a").unwrap().as_deref(), Some(&b"keep"[..]));
    }

    #[test]
    fn test_setattr_without_size_changes_nothing() {
        let store = store_with(&[("/a", "abc")]);
        let a = root(&store).lookup("a").unwrap();
        a.setattr(None).unwrap();
        assert!(!a.is_open());
        assert_eq!(store.get_value("/a").unwrap().as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_concurrent_writers_and_flush() {
        use std::thread;

        let store = store_with(&[]);
        let node = Arc::new(root(&store).create("shared").unwrap());
        let mut handles = vec![];

        for i in 0..8u8 {
            let node = node.clone();
            handles.push(thread::spawn(move || {
                for j in 0..50u64 {
                    node.write((u64::from(i) * 50 + j) * 4, &[i; 4]).unwrap();
                    if j % 10 == 0 {
                        node.flush().unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        node.flush().unwrap();

        let persisted = store.get_value("/shared").unwrap().unwrap();
        assert_eq!(persisted.len(), 8 * 50 * 4);
        assert_eq!(persisted, node.read(0, persisted.len()));
    }
}
