//! FUSE `FileSystem` trait implementation for `KvFs`.
//!
//! Every callback resolves its inode through the node table and hands the
//! work to the node; core errors become errno values on the way out.

use std::ffi::CStr;
use std::time::Duration;

use fuse_backend_rs::abi::fuse_abi::CreateIn;
use fuse_backend_rs::abi::fuse_abi::stat64;
use fuse_backend_rs::api::filesystem::Context;
use fuse_backend_rs::api::filesystem::DirEntry;
use fuse_backend_rs::api::filesystem::Entry;
use fuse_backend_rs::api::filesystem::FileSystem;
use fuse_backend_rs::api::filesystem::FsOptions;
use fuse_backend_rs::api::filesystem::OpenOptions;
use fuse_backend_rs::api::filesystem::SetattrValid;
use fuse_backend_rs::api::filesystem::ZeroCopyReader;
use fuse_backend_rs::api::filesystem::ZeroCopyWriter;
use tracing::debug;
use tracing::info;

use super::KvFs;
use crate::constants::ATTR_TTL;
use crate::constants::BLOCK_SIZE;
use crate::constants::MAX_NAME_LEN;
use crate::hierarchy::resolve;
use crate::inode::inode_for_path;

impl FileSystem for KvFs {
    type Inode = u64;
    type Handle = u64;

    fn init(&self, _capable: FsOptions) -> std::io::Result<FsOptions> {
        info!("FUSE session initialized");
        Ok(FsOptions::empty())
    }

    fn destroy(&self) {
        debug!(live_nodes = self.nodes.len(), "FUSE session destroyed");
    }

    fn lookup(&self, _ctx: &Context, parent: u64, name: &CStr) -> std::io::Result<Entry> {
        let name = Self::name_str(name)?;
        let parent = self.directory(parent)?;

        let child = parent.lookup(name)?;
        let (_, node) = self.nodes.remember(child);
        Ok(Self::make_entry(&node))
    }

    fn forget(&self, _ctx: &Context, inode: u64, count: u64) {
        self.nodes.forget(inode, count);
    }

    fn batch_forget(&self, _ctx: &Context, requests: Vec<(u64, u64)>) {
        for (inode, count) in requests {
            self.nodes.forget(inode, count);
        }
    }

    fn getattr(&self, _ctx: &Context, inode: u64, _handle: Option<u64>) -> std::io::Result<(stat64, Duration)> {
        let node = self.node(inode)?;
        Ok((Self::make_attr(&node.getattr()), ATTR_TTL))
    }

    fn setattr(
        &self,
        _ctx: &Context,
        inode: u64,
        attr: stat64,
        _handle: Option<u64>,
        valid: SetattrValid,
    ) -> std::io::Result<(stat64, Duration)> {
        let node = self.node(inode)?;

        // Mode, owner and times are fixed; only truncation/extension applies.
        let size = valid.contains(SetattrValid::SIZE).then_some(attr.st_size.max(0) as u64);
        let updated = node.setattr(size)?;
        Ok((Self::make_attr(&updated), ATTR_TTL))
    }

    fn opendir(&self, _ctx: &Context, inode: u64, _flags: u32) -> std::io::Result<(Option<u64>, OpenOptions)> {
        self.directory(inode)?;
        Ok((None, OpenOptions::empty()))
    }

    fn readdir(
        &self,
        _ctx: &Context,
        inode: u64,
        _handle: u64,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> std::io::Result<usize>,
    ) -> std::io::Result<()> {
        let dir = self.directory(inode)?;
        let children = dir.readdir()?;

        let dots = [(b".".as_slice(), inode), (b"..".as_slice(), Self::parent_inode(&dir))];
        let dot_entries = dots.into_iter().map(|(name, ino)| (name, ino, libc::DT_DIR as u32));
        let child_entries =
            children.iter().map(|child| (child.name.as_bytes(), child.inode, child.entry_type.dirent_type()));

        // Offsets are 1-based positions in the full listing; the kernel passes
        // the last one it consumed.
        for (position, (name, ino, type_)) in dot_entries.chain(child_entries).enumerate() {
            let next_offset = position as u64 + 1;
            if next_offset <= offset {
                continue;
            }
            let written = add_entry(DirEntry {
                ino,
                offset: next_offset,
                type_,
                name,
            })?;
            // Zero means the reply buffer is full.
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    fn releasedir(&self, _ctx: &Context, _inode: u64, _flags: u32, _handle: u64) -> std::io::Result<()> {
        Ok(())
    }

    fn fsyncdir(&self, _ctx: &Context, _inode: u64, _datasync: bool, _handle: u64) -> std::io::Result<()> {
        Ok(())
    }

    fn open(
        &self,
        _ctx: &Context,
        inode: u64,
        _flags: u32,
        _fuse_flags: u32,
    ) -> std::io::Result<(Option<u64>, OpenOptions, Option<u32>)> {
        let node = self.node(inode)?;
        node.open()?;
        // Bypass the page cache so every read is served from the node buffer.
        Ok((None, OpenOptions::DIRECT_IO, None))
    }

    fn read(
        &self,
        _ctx: &Context,
        inode: u64,
        _handle: u64,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> std::io::Result<usize> {
        let node = self.node(inode)?;
        let data = node.read(offset, size as usize);
        w.write_all(&data)?;
        Ok(data.len())
    }

    fn write(
        &self,
        _ctx: &Context,
        inode: u64,
        _handle: u64,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> std::io::Result<usize> {
        let node = self.node(inode)?;
        if !node.is_leaf() {
            return Err(std::io::Error::from_raw_os_error(libc::EISDIR));
        }

        let mut buf = vec![0u8; size as usize];
        r.read_exact(&mut buf)?;
        Ok(node.write(offset, &buf)?)
    }

    fn flush(&self, _ctx: &Context, inode: u64, _handle: u64, _lock_owner: u64) -> std::io::Result<()> {
        let node = self.node(inode)?;
        node.flush()?;
        Ok(())
    }

    fn fsync(&self, _ctx: &Context, inode: u64, _datasync: bool, _handle: u64) -> std::io::Result<()> {
        let node = self.node(inode)?;
        node.fsync()?;
        Ok(())
    }

    fn release(
        &self,
        _ctx: &Context,
        _inode: u64,
        _flags: u32,
        _handle: u64,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> std::io::Result<()> {
        // The buffer outlives the handle; it goes when the kernel forgets the inode.
        Ok(())
    }

    fn create(
        &self,
        _ctx: &Context,
        parent: u64,
        name: &CStr,
        _args: CreateIn,
    ) -> std::io::Result<(Entry, Option<u64>, OpenOptions, Option<u32>)> {
        let name = Self::name_str(name)?;
        let parent = self.directory(parent)?;

        let child = parent.create(name)?;
        let (_, node) = self.nodes.replace(child);
        Ok((Self::make_entry(&node), None, OpenOptions::DIRECT_IO, None))
    }

    fn mkdir(&self, _ctx: &Context, parent: u64, name: &CStr, _mode: u32, _umask: u32) -> std::io::Result<Entry> {
        let name = Self::name_str(name)?;
        let parent = self.directory(parent)?;

        let child = parent.mkdir(name)?;
        let (_, node) = self.nodes.replace(child);
        Ok(Self::make_entry(&node))
    }

    fn unlink(&self, _ctx: &Context, parent: u64, name: &CStr) -> std::io::Result<()> {
        let name = Self::name_str(name)?;
        let parent = self.directory(parent)?;

        parent.unlink(name)?;
        self.nodes.invalidate_path(&resolve(parent.path(), name));
        Ok(())
    }

    fn rmdir(&self, _ctx: &Context, parent: u64, name: &CStr) -> std::io::Result<()> {
        let name = Self::name_str(name)?;
        let parent = self.directory(parent)?;

        parent.rmdir(name)?;
        self.nodes.invalidate_path(&resolve(parent.path(), name));
        Ok(())
    }

    fn rename(
        &self,
        _ctx: &Context,
        olddir: u64,
        oldname: &CStr,
        newdir: u64,
        newname: &CStr,
        flags: u32,
    ) -> std::io::Result<()> {
        // RENAME_NOREPLACE / RENAME_EXCHANGE need atomic multi-key updates.
        if flags != 0 {
            return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
        }
        let oldname = Self::name_str(oldname)?;
        let newname = Self::name_str(newname)?;
        let old_parent = self.directory(olddir)?;
        let new_parent = self.directory(newdir)?;

        let old_path = resolve(old_parent.path(), oldname);
        let new_path = resolve(new_parent.path(), newname);
        debug!(from = %old_path, to = %new_path, "rename");

        // Unflushed writes must travel with the file.
        if let Some(live) = self.nodes.get(inode_for_path(&old_path))
            && live.path() == old_path
        {
            live.flush()?;
        }

        old_parent.rename(oldname, &new_parent, newname)?;
        if old_path == new_path {
            return Ok(());
        }
        // Whatever held the target was overwritten; the moved nodes keep
        // their inodes but now resolve and flush under the new path.
        self.nodes.invalidate_subtree(&new_path);
        self.nodes.relocate_subtree(&old_path, &new_path);
        Ok(())
    }

    fn statfs(&self, _ctx: &Context, _inode: u64) -> std::io::Result<libc::statvfs64> {
        // The store has no capacity notion; report fixed, plausible totals.
        // SAFETY: statvfs64 is a C struct that can be safely zero-initialized.
        // All fields are primitive types (integers) with no invariants.
        let mut st: libc::statvfs64 = unsafe { std::mem::zeroed() };

        st.f_bsize = u64::from(BLOCK_SIZE);
        st.f_frsize = u64::from(BLOCK_SIZE);
        st.f_blocks = 1024 * 1024 * 1024;
        st.f_bfree = 1024 * 1024 * 512;
        st.f_bavail = 1024 * 1024 * 512;
        st.f_files = 1_000_000;
        st.f_ffree = 900_000;
        st.f_favail = 900_000;
        st.f_namemax = MAX_NAME_LEN;

        Ok(st)
    }
}
