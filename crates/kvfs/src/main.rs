//! kvfs daemon.
//!
//! Mounts a redb key-value database as a POSIX filesystem and serves it
//! until SIGINT or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! kvfs /mnt/kv --path ./data.redb
//! kvfs /mnt/kv -p ./data.redb --mount-options allow_other,ro --threads 8
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kvfs::MountConfig;
use kvfs::MountOptions;
use kvfs::MountSession;
use kvfs::Ownership;
use kvfs::RedbStore;
use kvfs::constants::DEFAULT_FSNAME;
use kvfs::constants::DEFAULT_FUSE_THREADS;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kvfs", version)]
#[command(about = "Mount a key-value database as a POSIX filesystem")]
struct Args {
    /// Mount point path.
    mount_point: PathBuf,

    /// Path to the redb database file (created if missing).
    #[arg(long, short = 'p')]
    path: PathBuf,

    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(long, short)]
    verbose: bool,

    /// Comma-separated FUSE mount options.
    #[arg(long, value_delimiter = ',', default_value = "nonempty")]
    mount_options: Vec<String>,

    /// Filesystem name for mount.
    #[arg(long, default_value = DEFAULT_FSNAME)]
    fsname: String,

    /// Number of threads for handling FUSE requests.
    #[arg(long, default_value_t = DEFAULT_FUSE_THREADS)]
    threads: usize,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let options = MountOptions::parse(&args.mount_options);
    let config = match MountConfig::with_settings(&args.mount_point, options, args.fsname, args.threads) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let store = match RedbStore::open(&args.path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to open store");
            std::process::exit(1);
        }
    };
    info!(path = %store.path().display(), "store ready");

    let session = match MountSession::mount(&config, store, Ownership::current()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to mount filesystem");
            std::process::exit(1);
        }
    };

    if let Err(e) = session.run_until_signal() {
        error!(error = %e, "shutdown failed");
        std::process::exit(1);
    }
}
