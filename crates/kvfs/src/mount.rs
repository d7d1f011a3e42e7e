//! Binding a store to a mount point.
//!
//! A [`MountSession`] owns the kernel FUSE session, one worker thread per
//! channel, and the store handle it closes after unmounting.
//!
//! Shutdown starts on SIGINT/SIGTERM or when the kernel ends the session
//! (e.g. `fusermount -u`); both arrive on one channel.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::thread::JoinHandle;

use fuse_backend_rs::api::server::Server;
use fuse_backend_rs::transport::FuseChannel;
use fuse_backend_rs::transport::FuseSession;
use fuse_backend_rs::transport::Writer;
use snafu::ResultExt;
use snafu::Snafu;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::MountConfig;
use crate::fs::KvFs;
use crate::node::Ownership;
use crate::store::SharedStore;
use crate::store::StoreError;

/// Errors from mounting, serving and unmounting.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MountError {
    /// Failed to create the FUSE session.
    #[snafu(display("failed to create FUSE session: {source}"))]
    CreateSession { source: fuse_backend_rs::transport::Error },

    /// The kernel refused the mount.
    #[snafu(display("failed to mount filesystem: {source}"))]
    Mount { source: fuse_backend_rs::transport::Error },

    /// Failed to open a channel for a worker.
    #[snafu(display("failed to create FUSE channel: {source}"))]
    CreateChannel { source: fuse_backend_rs::transport::Error },

    /// Failed to spawn a worker thread.
    #[snafu(display("failed to spawn FUSE worker {index}: {source}"))]
    SpawnWorker { index: usize, source: std::io::Error },

    /// Failed to install the termination signal handler.
    #[snafu(display("failed to install signal handler: {source}"))]
    SignalHandler { source: ctrlc::Error },

    /// Failed to unmount.
    #[snafu(display("failed to unmount filesystem: {source}"))]
    Unmount { source: fuse_backend_rs::transport::Error },

    /// The store failed to close after unmounting.
    #[snafu(display("failed to close store: {source}"))]
    CloseStore { source: StoreError },
}

/// Why [`MountSession::run_until_signal`] stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    /// SIGINT or SIGTERM.
    Signal,
    /// A worker's channel closed; the mount is already gone.
    SessionEnded,
}

/// Reports a worker's exit when dropped, including on panic.
struct ExitNotice(mpsc::Sender<Shutdown>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        // The receiver is gone once shutdown is underway.
        let _ = self.0.send(Shutdown::SessionEnded);
    }
}

/// Block until the first shutdown request.
fn wait_for_shutdown(rx: &mpsc::Receiver<Shutdown>) -> Shutdown {
    rx.recv().unwrap_or(Shutdown::SessionEnded)
}

/// FUSE server wrapper for one worker thread.
struct FuseWorker {
    server: Arc<Server<KvFs>>,
    channel: FuseChannel,
}

impl FuseWorker {
    /// Process incoming FUSE requests until the kernel shuts down the session.
    fn service_loop(&mut self) {
        loop {
            match self.channel.get_request() {
                Ok(Some((reader, fuse_writer))) => {
                    let writer = Writer::FuseDev(fuse_writer);

                    if let Err(e) = self.server.handle_message(reader, writer, None, None) {
                        if let fuse_backend_rs::Error::EncodeMessage(ref io_err) = e
                            && io_err.raw_os_error() == Some(libc::EBADF)
                        {
                            info!("FUSE session closed by kernel");
                            break;
                        }
                        warn!(error = ?e, "error handling FUSE message");
                    }
                }
                Ok(None) => {
                    info!("FUSE session ended");
                    break;
                }
                Err(e) => {
                    let is_shutdown = matches!(
                        &e,
                        fuse_backend_rs::transport::Error::SessionFailure(msg)
                            if msg.contains("closed") || msg.contains("shutdown")
                    );
                    if is_shutdown {
                        info!("FUSE session closed");
                        break;
                    }
                    warn!(error = ?e, "error getting FUSE request");
                }
            }
        }
    }
}

/// A mounted store.
///
/// Dropping it without [`unmount`](Self::unmount) leaves the store open.
pub struct MountSession {
    session: FuseSession,
    mount_point: PathBuf,
    workers: Vec<JoinHandle<()>>,
    store: SharedStore,
    shutdown_tx: mpsc::Sender<Shutdown>,
    shutdown_rx: mpsc::Receiver<Shutdown>,
}

impl MountSession {
    /// Mount `store` at the configured mount point and start the workers.
    pub fn mount(config: &MountConfig, store: SharedStore, owner: Ownership) -> Result<Self, MountError> {
        info!(
            mount_point = %config.mount_point.display(),
            fsname = %config.fsname,
            threads = config.threads,
            read_only = config.options.read_only,
            allow_other = config.options.allow_other,
            "starting FUSE server"
        );

        let fs = KvFs::new(store.clone(), owner);
        let server = Arc::new(Server::new(fs));

        let mut session = FuseSession::new(&config.mount_point, &config.fsname, "", config.options.read_only)
            .context(CreateSessionSnafu)?;
        session.set_allow_other(config.options.allow_other);
        session.mount().context(MountSnafu)?;

        info!("filesystem mounted at {}", config.mount_point.display());

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let mut mounted = Self {
            session,
            mount_point: config.mount_point.clone(),
            workers: Vec::with_capacity(config.threads),
            store,
            shutdown_tx,
            shutdown_rx,
        };
        if let Err(e) = mounted.spawn_workers(&server, config.threads) {
            if let Err(umount_err) = mounted.session.umount() {
                error!(error = %umount_err, "failed to unmount after startup failure");
            }
            return Err(e);
        }
        Ok(mounted)
    }

    fn spawn_workers(&mut self, server: &Arc<Server<KvFs>>, count: usize) -> Result<(), MountError> {
        for index in 0..count {
            let channel = self.session.new_channel().context(CreateChannelSnafu)?;
            let mut worker = FuseWorker {
                server: server.clone(),
                channel,
            };
            let notice = ExitNotice(self.shutdown_tx.clone());
            let handle = thread::Builder::new()
                .name(format!("fuse-worker-{}", index))
                .spawn(move || {
                    let _notice = notice;
                    info!(thread = index, "FUSE worker started");
                    worker.service_loop();
                    info!(thread = index, "FUSE worker stopped");
                })
                .context(SpawnWorkerSnafu { index })?;
            self.workers.push(handle);
        }
        Ok(())
    }

    /// The absolute mount point.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Block until SIGINT or SIGTERM, or until the mount goes away on its
    /// own, then shut down.
    ///
    /// A second signal while unmounting exits the process with status 1.
    pub fn run_until_signal(self) -> Result<(), MountError> {
        let tx = self.shutdown_tx.clone();
        let signals = AtomicUsize::new(0);
        ctrlc::set_handler(move || {
            if signals.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = tx.send(Shutdown::Signal);
            } else {
                warn!("second signal received, exiting without clean unmount");
                std::process::exit(1);
            }
        })
        .context(SignalHandlerSnafu)?;

        info!(threads = self.workers.len(), "FUSE workers started, press Ctrl-C to unmount");
        let reason = wait_for_shutdown(&self.shutdown_rx);
        match reason {
            Shutdown::Signal => {
                info!("shutdown signal received, unmounting filesystem");
                self.unmount()
            }
            Shutdown::SessionEnded => {
                info!("FUSE session ended externally, shutting down");
                self.finish_after_session_end()
            }
        }
    }

    /// Unmount, wait for the workers to drain, then close the store.
    pub fn unmount(mut self) -> Result<(), MountError> {
        self.session.umount().context(UnmountSnafu)?;
        self.drain()
    }

    /// The kernel already dropped the mount. A failure releasing the session
    /// is logged and the store still closes.
    fn finish_after_session_end(mut self) -> Result<(), MountError> {
        if let Err(e) = self.session.umount() {
            warn!(error = %e, "releasing ended FUSE session failed");
        }
        self.drain()
    }

    /// Join the workers and close the store.
    fn drain(mut self) -> Result<(), MountError> {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("FUSE worker panicked");
            }
        }

        self.store.close().context(CloseStoreSnafu)?;
        info!("shutdown complete");
        Ok(())
    }
}
