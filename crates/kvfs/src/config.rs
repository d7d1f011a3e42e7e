//! Mount configuration.
//!
//! The binary parses command-line flags into a [`MountConfig`]; validation
//! happens once here so a bad flag fails before the store is opened.

use std::path::Path;
use std::path::PathBuf;

use snafu::ResultExt;
use snafu::Snafu;
use snafu::ensure;
use tracing::warn;

use crate::constants::DEFAULT_FSNAME;
use crate::constants::DEFAULT_FUSE_THREADS;
use crate::constants::MAX_FUSE_THREADS;
use crate::constants::MOUNT_OPT_ALLOW_OTHER;
use crate::constants::MOUNT_OPT_NONEMPTY;
use crate::constants::MOUNT_OPT_READ_ONLY;

/// Errors from validating a [`MountConfig`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// The mount point could not be made absolute or inspected.
    #[snafu(display("invalid mount point {}: {source}", path.display()))]
    MountPoint { path: PathBuf, source: std::io::Error },

    /// The mount point exists but is not a directory.
    #[snafu(display("mount point {} is not a directory", path.display()))]
    MountPointNotDirectory { path: PathBuf },

    /// Worker thread count outside `1..=MAX_FUSE_THREADS`.
    #[snafu(display("thread count {threads} must be between 1 and {MAX_FUSE_THREADS}"))]
    InvalidThreads { threads: usize },

    /// The filesystem name is empty or contains a comma.
    #[snafu(display("invalid filesystem name {fsname:?}"))]
    InvalidFsName { fsname: String },
}

/// Mount options understood by the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Let users other than the mounter access the tree.
    pub allow_other: bool,
    /// Mount read-only.
    pub read_only: bool,
    /// Unsupported options, kept for reporting.
    pub ignored: Vec<String>,
}

impl MountOptions {
    /// Interpret a list of option strings such as `["nonempty", "allow_other"]`.
    ///
    /// Entries may themselves be comma-separated. Unknown options are kept in
    /// [`ignored`](Self::ignored) and logged.
    pub fn parse<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = MountOptions::default();
        for raw in options {
            for option in raw.as_ref().split(',').map(str::trim).filter(|o| !o.is_empty()) {
                match option {
                    MOUNT_OPT_ALLOW_OTHER => parsed.allow_other = true,
                    MOUNT_OPT_READ_ONLY => parsed.read_only = true,
                    // The kernel mount path already accepts non-empty directories.
                    MOUNT_OPT_NONEMPTY => {}
                    other => {
                        warn!(option = other, "ignoring unsupported mount option");
                        parsed.ignored.push(other.to_string());
                    }
                }
            }
        }
        parsed
    }
}

/// Everything needed to mount a store.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Absolute path of the mount point.
    pub mount_point: PathBuf,
    pub options: MountOptions,
    /// Filesystem name reported to the kernel (shown by `mount`).
    pub fsname: String,
    /// Number of FUSE worker threads.
    pub threads: usize,
}

impl MountConfig {
    /// Validate and build a configuration with default fsname and threads.
    pub fn new(mount_point: impl AsRef<Path>, options: MountOptions) -> Result<Self, ConfigError> {
        Self::with_settings(mount_point, options, DEFAULT_FSNAME, DEFAULT_FUSE_THREADS)
    }

    /// Validate and build a fully specified configuration.
    ///
    /// The mount point is made absolute and must be an existing directory.
    pub fn with_settings(
        mount_point: impl AsRef<Path>,
        options: MountOptions,
        fsname: impl Into<String>,
        threads: usize,
    ) -> Result<Self, ConfigError> {
        let path = mount_point.as_ref();
        let mount_point = std::path::absolute(path).context(MountPointSnafu { path })?;
        let metadata = std::fs::metadata(&mount_point).context(MountPointSnafu { path: &mount_point })?;
        ensure!(metadata.is_dir(), MountPointNotDirectorySnafu { path: &mount_point });

        ensure!((1..=MAX_FUSE_THREADS).contains(&threads), InvalidThreadsSnafu { threads });

        let fsname = fsname.into();
        ensure!(!fsname.is_empty() && !fsname.contains(','), InvalidFsNameSnafu { fsname });

        Ok(Self {
            mount_point,
            options,
            fsname,
            threads,
        })
    }
}
