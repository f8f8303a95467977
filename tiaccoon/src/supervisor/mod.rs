//! Seccomp notification supervisor.
//!
//! Listens on the control UNIX socket for container runtimes, receives one
//! seccomp fd per container, and runs an isolated notification worker for
//! each. Everything below the accept loop is blocking syscall territory and
//! runs on blocking tasks and dedicated threads.

mod message;
mod notif;
mod rsocket;
mod socket;
mod syscall;
mod transport;
mod transport_ipv4;
mod transport_rdma;
mod transport_unix;
mod worker;

use std::net::IpAddr;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::Notify;

use tiaccoon_shared::{TiaccoonError, TiaccoonResult};

use crate::destination::DestinationTable;
use crate::policy::AccessControl;
use worker::NotifWorker;

/// Close a raw fd, ignoring the result. Used where the fd is already dead
/// or the error is not actionable.
pub(crate) fn close_fd(fd: RawFd) {
    let _ = unsafe { libc::close(fd) };
}

/// The control-socket dispatcher.
pub struct Supervisor {
    access: AccessControl,
    dest: Arc<DestinationTable>,
    socket_path: PathBuf,
    my_vip: IpAddr,
    feature_rdma: bool,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Supervisor {
    pub fn new(
        access: AccessControl,
        dest: Arc<DestinationTable>,
        socket_path: PathBuf,
        my_vip: IpAddr,
        feature_rdma: bool,
    ) -> Self {
        Supervisor {
            access,
            dest,
            socket_path,
            my_vip,
            feature_rdma,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Bind the control socket and accept runtime connections until
    /// [`Supervisor::close`] is called.
    pub async fn start(&self) -> TiaccoonResult<()> {
        if let Some(dir) = self.socket_path.parent() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(dir)
                .map_err(|e| {
                    TiaccoonError::Internal(format!(
                        "creating control socket directory {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
        }
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(TiaccoonError::Internal(format!(
                    "removing stale control socket {}: {}",
                    self.socket_path.display(),
                    e
                )));
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            TiaccoonError::Internal(format!(
                "listening on control socket {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        tracing::debug!(path = %self.socket_path.display(), "listening on control socket");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::debug!("closing control socket");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            if self.closed.load(Ordering::SeqCst) {
                                return Ok(());
                            }
                            tracing::error!(error = %e, "failed to accept on control socket");
                            continue;
                        }
                    };
                    self.handle_connection(stream);
                }
            }
        }
    }

    /// Stop accepting new containers. Running workers keep going until their
    /// seccomp fds die.
    pub fn close(&self) {
        tracing::debug!("closing supervisor");
        self.closed.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a close that lands between two
        // accept iterations is not lost
        self.shutdown.notify_one();
    }

    fn handle_connection(&self, stream: tokio::net::UnixStream) {
        let std_stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "failed to detach control connection");
                return;
            }
        };
        if let Err(e) = std_stream.set_nonblocking(false) {
            tracing::error!(error = %e, "failed to make control connection blocking");
            return;
        }

        let access = self.access.clone();
        let dest = self.dest.clone();
        let my_vip = self.my_vip;
        let feature_rdma = self.feature_rdma;

        // recvmsg and the whole notification loop are blocking; keep them
        // off the runtime's async workers.
        tokio::task::spawn_blocking(move || {
            let received = message::recv_seccomp_fd(std_stream.as_raw_fd());
            drop(std_stream);
            match received {
                Ok((fd, state)) => {
                    tracing::info!(fd, container = %state.state.id, "received seccomp fd");
                    NotifWorker::new(fd, state, access, dest, my_vip, feature_rdma).run();
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to receive seccomp fd");
                }
            }
        });
    }
}
