//! Resource bounds and fixed attributes for the kvfs mount.
//!
//! Every limit lives here so the FUSE adapter and the binary agree on them.

use std::time::Duration;

/// Path separator shared by filesystem paths and store keys.
pub const SEPARATOR: char = '/';

/// Root inode number (always 1 per FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// TTL for cached file attributes.
///
/// Short enough that mutations made directly against the store show up
/// promptly, long enough to avoid a round trip per syscall.
pub const ATTR_TTL: Duration = Duration::from_millis(200);

/// TTL for cached directory entries.
pub const ENTRY_TTL: Duration = Duration::from_millis(200);

/// Permission bits for regular files.
pub const FILE_PERMISSIONS: u32 = 0o644;

/// Permission bits for directories.
pub const DIR_PERMISSIONS: u32 = 0o755;

/// Default file mode for regular files (0644 with the regular-file bit).
pub const DEFAULT_FILE_MODE: u32 = libc::S_IFREG | FILE_PERMISSIONS;

/// Default directory mode (0755 with the directory bit).
pub const DEFAULT_DIR_MODE: u32 = libc::S_IFDIR | DIR_PERMISSIONS;

/// Block size reported in attributes and statfs.
pub const BLOCK_SIZE: u32 = 4096;

/// Largest file content a node will buffer, in bytes.
///
/// Writes and truncates past this fail with `EFBIG` instead of asking the
/// allocator for whatever size the kernel passed through.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

/// Longest single path segment reported by statfs.
pub const MAX_NAME_LEN: u64 = 255;

/// Default number of FUSE worker threads.
pub const DEFAULT_FUSE_THREADS: usize = 4;

/// Upper bound on FUSE worker threads.
pub const MAX_FUSE_THREADS: usize = 64;

/// Default filesystem name reported to the kernel.
pub const DEFAULT_FSNAME: &str = "kvfs";

/// Mount option accepted for compatibility with fusermount-style setups.
pub const MOUNT_OPT_NONEMPTY: &str = "nonempty";

/// Mount option allowing other users to access the mount.
pub const MOUNT_OPT_ALLOW_OTHER: &str = "allow_other";

/// Mount option making the mount read-only.
pub const MOUNT_OPT_READ_ONLY: &str = "ro";

/// Name of the redb table holding every key.
pub const REDB_TABLE_NAME: &str = "kv";

// ============================================================================
// Compile-Time Constant Assertions
// ============================================================================

const _: () = assert!(ROOT_INODE == 1);

const _: () = assert!(BLOCK_SIZE > 0);
const _: () = assert!(BLOCK_SIZE.count_ones() == 1); // power of 2

const _: () = assert!(MAX_FILE_SIZE > 0);
const _: () = assert!(MAX_FILE_SIZE <= isize::MAX as u64); // fits a Vec on every target

const _: () = assert!(ATTR_TTL.as_millis() == 200);
const _: () = assert!(ENTRY_TTL.as_millis() == ATTR_TTL.as_millis());

const _: () = assert!(DEFAULT_FUSE_THREADS > 0);
const _: () = assert!(DEFAULT_FUSE_THREADS <= MAX_FUSE_THREADS);

const _: () = assert!(FILE_PERMISSIONS & !0o777 == 0);
const _: () = assert!(DIR_PERMISSIONS & !0o777 == 0);
