//! Transport adapter dispatch.
//!
//! Adapters turn a destination entry into concrete host socket operations.
//! `connect` and `bind` return a host fd the caller owns; `accept` runs on
//! its own thread per listening host socket and feeds the record's queue.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use nix::errno::Errno;
use nix::sys::socket::{recv, send, MsgFlags};
use tokio::sync::mpsc;

use tiaccoon_shared::{TiaccoonError, TiaccoonResult};

use crate::destination::{Entry, TransportKind};
use crate::policy::PolicyTable;
use crate::sockaddr::{Sockaddr, VIRTUAL_SOCKADDR_SIZE};

use super::close_fd;
use super::socket::{
    FcntlOption, HostSocket, HostSocketMap, HostSocketState, SocketOption, SocketRecord,
};
use super::{transport_ipv4, transport_rdma, transport_unix};

/// Turn a negative return into the current errno.
pub(crate) fn cvt(rc: libc::c_int) -> nix::Result<libc::c_int> {
    if rc < 0 {
        Err(Errno::last())
    } else {
        Ok(rc)
    }
}

pub(crate) fn connect(sock: &SocketRecord, entry: &Entry) -> TiaccoonResult<RawFd> {
    match entry.transport {
        TransportKind::Unix => transport_unix::connect(sock, entry),
        TransportKind::Rdma => transport_rdma::connect(sock, entry),
        TransportKind::Ipv6 => Err(TiaccoonError::UnsupportedTransport("IPv6".into())),
        TransportKind::Ipv4 => transport_ipv4::connect(sock, entry),
    }
}

pub(crate) fn bind(sock: &SocketRecord, entry: &Entry) -> TiaccoonResult<RawFd> {
    match entry.transport {
        TransportKind::Unix => transport_unix::bind(sock, entry),
        TransportKind::Rdma => transport_rdma::bind(sock, entry),
        TransportKind::Ipv6 => Err(TiaccoonError::UnsupportedTransport("IPv6".into())),
        TransportKind::Ipv4 => transport_ipv4::bind(sock, entry),
    }
}

pub(crate) fn listen(kind: TransportKind, host_fd: RawFd, backlog: i32) -> TiaccoonResult<()> {
    match kind {
        TransportKind::Unix | TransportKind::Ipv6 | TransportKind::Ipv4 => {
            cvt(unsafe { libc::listen(host_fd, backlog) })
                .map_err(|e| TiaccoonError::Syscall(format!("listen: {}", e)))?;
            Ok(())
        }
        TransportKind::Rdma => Err(TiaccoonError::UnsupportedTransport(
            "RDMA host sockets cannot listen".into(),
        )),
    }
}

fn accept(kind: TransportKind, host_fd: RawFd) -> TiaccoonResult<(RawFd, Entry)> {
    match kind {
        TransportKind::Unix => transport_unix::accept(host_fd),
        TransportKind::Rdma => Err(TiaccoonError::UnsupportedTransport(
            "RDMA host sockets cannot accept".into(),
        )),
        TransportKind::Ipv6 => Err(TiaccoonError::UnsupportedTransport("IPv6".into())),
        TransportKind::Ipv4 => transport_ipv4::accept(host_fd),
    }
}

/// Replay the record's recorded socket options and fcntl flags onto a fresh
/// host socket before it binds or connects.
pub(crate) fn configure_socket(fd: RawFd, sock: &SocketRecord) -> TiaccoonResult<()> {
    for option in &sock.socket_options {
        apply_sockopt(fd, option)?;
        tracing::debug!(
            host_fd = fd,
            level = option.level,
            optname = option.optname,
            "replayed socket option"
        );
    }
    for option in &sock.fcntl_options {
        apply_fcntl(fd, option)?;
        tracing::debug!(host_fd = fd, cmd = option.cmd, "replayed fcntl option");
    }
    Ok(())
}

pub(crate) fn apply_sockopt(fd: RawFd, option: &SocketOption) -> TiaccoonResult<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            option.level as libc::c_int,
            option.optname as libc::c_int,
            option.optval.as_ptr() as *const libc::c_void,
            option.optval.len() as libc::socklen_t,
        )
    };
    cvt(rc).map_err(|e| {
        TiaccoonError::Syscall(format!(
            "setsockopt(level={}, optname={}): {}",
            option.level, option.optname, e
        ))
    })?;
    Ok(())
}

pub(crate) fn apply_fcntl(fd: RawFd, option: &FcntlOption) -> TiaccoonResult<()> {
    let rc = unsafe { libc::fcntl(fd, option.cmd as libc::c_int, option.value as libc::c_int) };
    cvt(rc).map_err(|e| {
        TiaccoonError::Syscall(format!("fcntl(cmd=0x{:x}): {}", option.cmd, e))
    })?;
    Ok(())
}

/// Send the connect-preamble on a freshly connected host socket.
pub(crate) fn send_preamble(fd: RawFd, bytes: &[u8]) -> TiaccoonResult<()> {
    let n = send(fd, bytes, MsgFlags::empty())
        .map_err(|e| TiaccoonError::Syscall(format!("sending preamble: {}", e)))?;
    if n != bytes.len() {
        return Err(TiaccoonError::Syscall(format!(
            "short preamble send: {} of {} bytes",
            n,
            bytes.len()
        )));
    }
    Ok(())
}

/// Read the peer's connect-preamble from a just-accepted host socket to
/// learn its virtual identity.
pub(crate) fn recv_peer_vaddr(fd: RawFd) -> TiaccoonResult<Sockaddr> {
    let mut buf = [0u8; VIRTUAL_SOCKADDR_SIZE];
    let n = recv(fd, &mut buf, MsgFlags::empty())
        .map_err(|e| TiaccoonError::Syscall(format!("receiving preamble: {}", e)))?;
    if n != VIRTUAL_SOCKADDR_SIZE {
        return Err(TiaccoonError::Parse(format!(
            "short preamble: {} of {} bytes",
            n, VIRTUAL_SOCKADDR_SIZE
        )));
    }
    Sockaddr::parse(&buf)
}

/// Spawn the accept loop for one listening host socket.
pub(crate) fn spawn_accept_task(
    listen_fd: RawFd,
    entry: Arc<Entry>,
    cancel: Arc<AtomicBool>,
    host_sockets: HostSocketMap,
    queue: mpsc::Sender<HostSocket>,
    server_policy: Arc<PolicyTable>,
) {
    let spawned = thread::Builder::new()
        .name(format!("accept-{}", listen_fd))
        .spawn(move || {
            run_accept_task(listen_fd, entry, cancel, host_sockets, queue, server_policy)
        });
    if let Err(e) = spawned {
        tracing::error!(listen_fd, error = %e, "failed to spawn accept task");
    }
}

fn run_accept_task(
    listen_fd: RawFd,
    entry: Arc<Entry>,
    cancel: Arc<AtomicBool>,
    host_sockets: HostSocketMap,
    queue: mpsc::Sender<HostSocket>,
    server_policy: Arc<PolicyTable>,
) {
    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let (fd, peer_entry) = match accept(entry.transport, listen_fd) {
            Ok(accepted) => accepted,
            Err(e) => {
                if cancel.load(Ordering::SeqCst) {
                    // record teardown shut the listener down under us
                    return;
                }
                tracing::error!(listen_fd, error = %e, "accept failed on host socket");
                if let Some(hs) = host_sockets.lock().get_mut(&listen_fd) {
                    hs.state = HostSocketState::Error;
                }
                cancel.store(true, Ordering::SeqCst);
                return;
            }
        };

        if let Err(e) = server_policy.check(peer_entry.vip) {
            tracing::error!(
                listen_fd,
                peer_vip = %peer_entry.vip,
                peer = %peer_entry.address,
                error = %e,
                "access control denied for accepted connection"
            );
            close_fd(fd);
            continue;
        }
        tracing::info!(
            listen_fd,
            accepted_fd = fd,
            peer_vip = %peer_entry.vip,
            "access control allowed for accepted connection"
        );

        let accepted = HostSocket {
            fd,
            entry: Arc::new(peer_entry),
            state: HostSocketState::Accepted,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        host_sockets.lock().insert(fd, accepted.clone());
        if queue.blocking_send(accepted).is_err() {
            // receiver dropped with the record
            host_sockets.lock().remove(&fd);
            close_fd(fd);
            return;
        }
    }
}
