//! Errors surfaced by filesystem nodes.
//!
//! The FUSE boundary only speaks errno, so every variant maps onto one via
//! `From<Error> for std::io::Error`. Store failures of any kind collapse to
//! `EIO`; the store error is kept as the source for logging.

use std::collections::TryReserveError;

use snafu::Snafu;

use crate::store::StoreError;

/// Result alias for node operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors from [`VirtualNode`](crate::node::VirtualNode) operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// No key matches the path.
    #[snafu(display("no such file or directory: {path}"))]
    NotFound { path: String },

    /// The store failed while serving `path`.
    #[snafu(display("store operation failed for {path}: {source}"))]
    Store { path: String, source: StoreError },

    /// A directory still has children.
    #[snafu(display("directory not empty: {path}"))]
    NotEmpty { path: String },

    /// A directory operation was aimed at a file.
    #[snafu(display("not a directory: {path}"))]
    NotADirectory { path: String },

    /// A file operation was aimed at a directory.
    #[snafu(display("is a directory: {path}"))]
    IsADirectory { path: String },

    /// A write or truncate would grow the file past
    /// [`MAX_FILE_SIZE`](crate::constants::MAX_FILE_SIZE).
    #[snafu(display("file too large: {path} ({size} bytes)"))]
    FileTooLarge { path: String, size: u64 },

    /// The buffer could not grow to the requested length.
    #[snafu(display("cannot grow buffer for {path}: {source}"))]
    OutOfSpace { path: String, source: TryReserveError },
}

impl Error {
    /// The errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound { .. } => libc::ENOENT,
            Error::Store { .. } => libc::EIO,
            Error::NotEmpty { .. } => libc::ENOTEMPTY,
            Error::NotADirectory { .. } => libc::ENOTDIR,
            Error::IsADirectory { .. } => libc::EISDIR,
            Error::FileTooLarge { .. } => libc::EFBIG,
            Error::OutOfSpace { .. } => libc::ENOSPC,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        std::io::Error::from_raw_os_error(err.errno())
    }
}
