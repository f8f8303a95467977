//! Socket records and the per-syscall handlers.
//!
//! Every container `(pid, fd)` the engine has seen gets a record tracking
//! its bypass state, the virtual addresses it claims, the socket options it
//! recorded, and the host sockets shadowing it. Handlers run on the
//! notification worker and drive the state machine:
//!
//! `NotBypassed → Binded → Listening` on the server path, `NotBypassed →
//! Bypassed` on the client path, `Error` on policy or transport failure
//! (never recovers), `NotBypassable` for fds the engine will not touch.

use std::collections::HashMap;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tiaccoon_shared::{TiaccoonError, TRY_RDMA_SENTINEL};

use crate::destination::{Entry, TransportAddr};
use crate::sockaddr::{Sockaddr, VIRTUAL_SOCKADDR_SIZE};

use super::close_fd;
use super::notif::{self, SeccompNotif, SeccompNotifAddfd, SeccompNotifResp, SECCOMP_ADDFD_FLAG_SETFD};
use super::transport;
use super::worker::NotifWorker;

/// Capacity of the per-record accepted-connection queue. A producer that
/// fills it blocks, back-pressuring the host listen queue.
pub(crate) const ACCEPT_QUEUE_CAPACITY: usize = (1 << 16) - 1;

/// One recorded `setsockopt` call, replayed onto host sockets.
#[derive(Debug, Clone)]
pub(crate) struct SocketOption {
    pub level: u64,
    pub optname: u64,
    pub optval: Vec<u8>,
    pub optlen: u64,
}

/// One recorded `fcntl` call (`F_SETFD`/`F_SETFL` only).
#[derive(Debug, Clone, Copy)]
pub(crate) struct FcntlOption {
    pub cmd: u64,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketState {
    /// Not a socket, not IP, not stream, or already connected.
    NotBypassable,
    NotBypassed,
    Binded,
    Listening,
    /// The container's fd has been replaced by a host-side fd.
    Bypassed,
    /// Terminal failure; syscalls pass through until close.
    Error,
}

impl SocketState {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketState::NotBypassable => "NotBypassable",
            SocketState::NotBypassed => "NotBypassed",
            SocketState::Binded => "Binded",
            SocketState::Listening => "Listening",
            SocketState::Bypassed => "Bypassed",
            SocketState::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostSocketState {
    Binded,
    Listening,
    /// Accepted on the host, not yet handed to the container.
    Accepted,
    Error,
}

/// A host-side socket shadowing a container socket: either a bound/listening
/// server socket or an accepted connection waiting in the queue.
#[derive(Debug, Clone)]
pub(crate) struct HostSocket {
    pub fd: RawFd,
    /// For server sockets the destination entry that was bound; for accepted
    /// sockets the peer's virtual identity and real address.
    pub entry: Arc<Entry>,
    pub state: HostSocketState,
    pub cancel: Arc<AtomicBool>,
}

/// Shared map of host sockets for one record. Accept tasks and the
/// notification worker both touch it.
pub(crate) type HostSocketMap = Arc<Mutex<HashMap<RawFd, HostSocket>>>;

pub(crate) struct SocketRecord {
    pub state: SocketState,
    pub pid: i32,
    pub sockfd: i32,
    pub sock_domain: i32,
    pub sock_type: i32,
    pub sock_protocol: i32,
    pub local_vaddr: Sockaddr,
    pub remote_vaddr: Sockaddr,
    pub socket_options: Vec<SocketOption>,
    pub fcntl_options: Vec<FcntlOption>,
    pub host_sockets: HostSocketMap,
    pub accepted_tx: mpsc::Sender<HostSocket>,
    pub accepted_rx: mpsc::Receiver<HostSocket>,
    pub cancel: Arc<AtomicBool>,
}

impl SocketRecord {
    pub fn new(pid: i32, sockfd: i32, domain: i32, sock_type: i32, protocol: i32) -> Self {
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        SocketRecord {
            state: SocketState::NotBypassed,
            pid,
            sockfd,
            sock_domain: domain,
            sock_type,
            sock_protocol: protocol,
            local_vaddr: Sockaddr::zero(),
            remote_vaddr: Sockaddr::zero(),
            socket_options: Vec::new(),
            fcntl_options: Vec::new(),
            host_sockets: Arc::new(Mutex::new(HashMap::new())),
            accepted_tx,
            accepted_rx,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the accept tasks and release every host socket. The shutdown
    /// is what actually unblocks a thread sitting in `accept(2)`.
    pub fn teardown(&mut self) {
        let mut map = self.host_sockets.lock();
        for (_, hs) in map.drain() {
            hs.cancel.store(true, Ordering::SeqCst);
            if unsafe { libc::shutdown(hs.fd, libc::SHUT_RDWR) } < 0 {
                tracing::debug!(
                    host_fd = hs.fd,
                    error = %Errno::last(),
                    "shutdown of host socket failed"
                );
            }
            close_fd(hs.fd);
            tracing::debug!(host_fd = hs.fd, "closed host socket");
        }
        drop(map);
        self.cancel.store(true, Ordering::SeqCst);
    }
}

/// Per-process table of socket records, keyed by the container fd number.
#[derive(Default)]
pub(crate) struct ProcessRecord {
    pub sockets: HashMap<i32, SocketRecord>,
}

impl NotifWorker {
    pub(crate) fn handle_bind(
        &mut self,
        pid: i32,
        sockfd: i32,
        req: &SeccompNotif,
        resp: &mut SeccompNotifResp,
    ) {
        let Some(state) = self.socket_state(pid, sockfd) else {
            return;
        };
        if state != SocketState::NotBypassed {
            tracing::error!(pid, sockfd, state = state.as_str(), "unexpected state for bind");
            resp.fail(Errno::EINVAL);
            return;
        }

        let dst = match self.read_sockaddr(pid, req.data.args[1], req.data.args[2]) {
            Ok(sa) => sa,
            Err(e) => {
                tracing::error!(pid, sockfd, error = %e, "failed to read bind sockaddr");
                self.set_socket_state(pid, sockfd, SocketState::Error);
                resp.fail(Errno::EACCES);
                return;
            }
        };
        tracing::debug!(pid, sockfd, addr = %dst, "bind requested");
        self.with_socket(pid, sockfd, |sock| sock.local_vaddr = dst.clone());

        let Some(entries) = self.dest.get_server(dst.port) else {
            tracing::warn!(
                pid,
                sockfd,
                vport = dst.port,
                "no server destination for port; leaving bind to the kernel"
            );
            return;
        };

        let mut bound = false;
        let mut rdma = false;
        for entry in &entries {
            let result = match self.socket_ref(pid, sockfd) {
                Some(sock) => transport::bind(sock, entry),
                None => return,
            };
            match result {
                Ok(host_fd) => {
                    let hs = HostSocket {
                        fd: host_fd,
                        entry: entry.clone(),
                        state: HostSocketState::Binded,
                        cancel: Arc::new(AtomicBool::new(false)),
                    };
                    self.with_socket(pid, sockfd, |sock| {
                        sock.host_sockets.lock().insert(host_fd, hs)
                    });
                    bound = true;
                    tracing::info!(pid, sockfd, host_fd, address = %entry.address, "bound on host");
                }
                Err(e) if e.is_try_rdma() && self.feature_rdma => {
                    let TiaccoonError::TryRdma { addrlen } = e else {
                        continue;
                    };
                    tracing::info!(pid, sockfd, address = %entry.address, "redirecting bind to RDMA");
                    if !self.write_rdma_addr(pid, req.data.args[1], entry) {
                        continue;
                    }
                    bound = true;
                    rdma = true;
                    resp.succeed((TRY_RDMA_SENTINEL + addrlen) as i64);
                }
                Err(e) => {
                    tracing::warn!(pid, sockfd, address = %entry.address, error = %e, "failed to bind");
                }
            }
        }

        if !bound {
            tracing::error!(pid, sockfd, vport = dst.port, "failed to bind on every entry");
            self.set_socket_state(pid, sockfd, SocketState::Error);
            resp.fail(Errno::EACCES);
            return;
        }

        self.set_socket_state(pid, sockfd, SocketState::Binded);
        if !rdma {
            resp.succeed(0);
        }
        tracing::info!(pid, sockfd, addr = %dst, "bind bypassed");
    }

    pub(crate) fn handle_listen(
        &mut self,
        pid: i32,
        sockfd: i32,
        req: &SeccompNotif,
        resp: &mut SeccompNotifResp,
    ) {
        let Some(state) = self.socket_state(pid, sockfd) else {
            return;
        };
        match state {
            SocketState::Binded => {}
            SocketState::Listening => {
                tracing::error!(pid, sockfd, "already listening");
                resp.fail(Errno::EADDRINUSE);
                return;
            }
            other => {
                tracing::error!(pid, sockfd, state = other.as_str(), "unexpected state for listen");
                self.set_socket_state(pid, sockfd, SocketState::NotBypassable);
                return;
            }
        }

        let backlog = req.data.args[1] as i32;
        let Some((host_sockets, accepted_tx)) = self
            .socket_ref(pid, sockfd)
            .map(|sock| (sock.host_sockets.clone(), sock.accepted_tx.clone()))
        else {
            return;
        };

        let bound: Vec<HostSocket> = host_sockets
            .lock()
            .values()
            .filter(|hs| hs.state == HostSocketState::Binded)
            .cloned()
            .collect();

        let mut listening = false;
        for hs in bound {
            match transport::listen(hs.entry.transport, hs.fd, backlog) {
                Ok(()) => {
                    if let Some(tracked) = host_sockets.lock().get_mut(&hs.fd) {
                        tracked.state = HostSocketState::Listening;
                    }
                    // The container's threaded accept cannot be cancelled
                    // from within the process, so accepting starts now
                    // rather than on demand.
                    transport::spawn_accept_task(
                        hs.fd,
                        hs.entry.clone(),
                        hs.cancel.clone(),
                        host_sockets.clone(),
                        accepted_tx.clone(),
                        self.access.server.clone(),
                    );
                    listening = true;
                    tracing::info!(
                        pid,
                        sockfd,
                        host_fd = hs.fd,
                        backlog,
                        "listening and accepting on host"
                    );
                }
                Err(e) => {
                    tracing::warn!(pid, sockfd, host_fd = hs.fd, error = %e, "failed to listen");
                    if let Some(tracked) = host_sockets.lock().get_mut(&hs.fd) {
                        tracked.state = HostSocketState::Error;
                    }
                }
            }
        }

        if !listening && !self.feature_rdma {
            tracing::error!(pid, sockfd, "no host socket reached the listening state");
            self.set_socket_state(pid, sockfd, SocketState::Error);
            resp.fail(Errno::EACCES);
            return;
        }

        self.set_socket_state(pid, sockfd, SocketState::Listening);
        resp.succeed(0);
    }

    pub(crate) fn handle_accept(
        &mut self,
        pid: i32,
        sockfd: i32,
        req: &SeccompNotif,
        resp: &mut SeccompNotifResp,
        flags: u64,
    ) {
        let Some(state) = self.socket_state(pid, sockfd) else {
            return;
        };
        if state != SocketState::Listening {
            tracing::error!(pid, sockfd, state = state.as_str(), "unexpected state for accept");
            resp.fail(Errno::EINVAL);
            return;
        }
        if flags != 0 {
            // accept4 flags are not propagated: the host socket was accepted
            // long before the container asked for it.
            tracing::debug!(pid, sockfd, flags, "ignoring accept4 flags");
        }

        tracing::debug!(pid, sockfd, "waiting for an accepted connection");
        let hs = {
            let Some(sock) = self.socket_mut(pid, sockfd) else {
                return;
            };
            sock.accepted_rx.blocking_recv()
        };
        let Some(hs) = hs else {
            // queue closed by teardown
            return;
        };
        if hs.state != HostSocketState::Accepted {
            tracing::error!(pid, sockfd, state = ?hs.state, "unexpected host socket in queue");
            self.set_socket_state(pid, sockfd, SocketState::NotBypassable);
            return;
        }
        tracing::info!(pid, sockfd, accepted_fd = hs.fd, "dequeued accepted connection");

        let addfd = SeccompNotifAddfd {
            id: req.id,
            flags: 0,
            srcfd: hs.fd as u32,
            newfd: 0,
            newfd_flags: 0,
        };
        let newfd = match notif::addfd(self.fd, &addfd) {
            Ok(fd) => fd,
            Err(e) => {
                tracing::error!(pid, sockfd, error = %e, "fd injection failed");
                close_fd(hs.fd);
                self.set_socket_state(pid, sockfd, SocketState::NotBypassable);
                return;
            }
        };
        close_fd(hs.fd);

        if let Err(e) = self.register_socket(pid, newfd) {
            tracing::error!(pid, newfd, error = %e, "failed to register accepted socket");
        }

        let Some((local_vaddr, options)) = self
            .socket_ref(pid, sockfd)
            .map(|sock| (sock.local_vaddr.clone(), sock.socket_options.clone()))
        else {
            return;
        };

        let src_addr = match Sockaddr::from_ip_port(
            local_vaddr.family,
            hs.entry.vip,
            hs.entry.vport,
            local_vaddr.flowinfo,
            local_vaddr.scope_id,
        ) {
            Ok(sa) => Some(sa),
            Err(e) => {
                tracing::warn!(pid, sockfd, error = %e, "failed to build virtual source address");
                None
            }
        };

        self.with_socket(pid, newfd, |child| {
            child.state = SocketState::Bypassed;
            child.local_vaddr = local_vaddr.clone();
            child.socket_options = options.clone();
            if let Some(sa) = &src_addr {
                child.remote_vaddr = sa.clone();
            }
        });

        if let Some(sa) = &src_addr {
            if let Err(e) = self.write_sockaddr(pid, req.data.args[1], sa) {
                tracing::warn!(pid, sockfd, error = %e, "failed to write peer sockaddr");
            }
        }

        self.with_socket(pid, sockfd, |sock| {
            sock.host_sockets.lock().remove(&hs.fd)
        });

        resp.succeed(i64::from(newfd));
        tracing::info!(pid, sockfd, newfd, peer = %hs.entry.address, "accept bypassed");
    }

    pub(crate) fn handle_connect(
        &mut self,
        pid: i32,
        sockfd: i32,
        req: &SeccompNotif,
        resp: &mut SeccompNotifResp,
    ) {
        let dst = match self.read_sockaddr(pid, req.data.args[1], req.data.args[2]) {
            Ok(sa) => sa,
            Err(e) => {
                tracing::error!(pid, sockfd, error = %e, "failed to read connect sockaddr");
                self.set_socket_state(pid, sockfd, SocketState::NotBypassable);
                return;
            }
        };
        tracing::debug!(pid, sockfd, dst = %dst, "connect requested");
        self.with_socket(pid, sockfd, |sock| sock.remote_vaddr = dst.clone());

        if let Err(e) = self.access.client.check(dst.ip) {
            tracing::error!(pid, sockfd, dst = %dst, error = %e, "access control denied");
            self.set_socket_state(pid, sockfd, SocketState::Error);
            resp.fail(Errno::EACCES);
            return;
        }
        tracing::info!(pid, sockfd, dst = %dst, "access control allowed");

        let Some(buckets) = self.dest.get_client(dst.ip, dst.port) else {
            tracing::error!(pid, sockfd, dst = %dst, "destination not found");
            self.set_socket_state(pid, sockfd, SocketState::Error);
            resp.fail(Errno::EACCES);
            return;
        };

        let mut connected: Option<RawFd> = None;
        'groups: for bucket in &buckets {
            if bucket.is_empty() {
                continue;
            }
            // Balance load inside the group: random order, no repeats.
            let mut order: Vec<usize> = (0..bucket.len()).collect();
            {
                use rand::seq::SliceRandom;
                order.shuffle(&mut rand::rng());
            }
            for i in order {
                let entry = &bucket[i];
                let result = match self.socket_ref(pid, sockfd) {
                    Some(sock) => transport::connect(sock, entry),
                    None => return,
                };
                match result {
                    Ok(host_fd) => {
                        tracing::info!(pid, sockfd, host_fd, address = %entry.address, "connected on host");
                        connected = Some(host_fd);
                        break 'groups;
                    }
                    Err(e) if e.is_try_rdma() && self.feature_rdma => {
                        let TiaccoonError::TryRdma { addrlen } = e else {
                            continue;
                        };
                        tracing::info!(pid, sockfd, address = %entry.address, "redirecting connect to RDMA");
                        if !self.write_rdma_addr(pid, req.data.args[1], entry) {
                            continue;
                        }
                        self.set_socket_state(pid, sockfd, SocketState::Bypassed);
                        resp.succeed((TRY_RDMA_SENTINEL + addrlen) as i64);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(pid, sockfd, address = %entry.address, error = %e, "failed to connect");
                    }
                }
            }
        }

        let Some(host_fd) = connected else {
            tracing::error!(pid, sockfd, dst = %dst, "failed to connect to every destination");
            self.set_socket_state(pid, sockfd, SocketState::Error);
            resp.fail(Errno::EACCES);
            return;
        };

        // Preamble: announce this side's virtual identity to the peer agent.
        if let Some(local) = self.socket_ref(pid, sockfd).map(|s| s.local_vaddr.clone()) {
            match local.to_bytes() {
                Ok(bytes) if bytes.len() == VIRTUAL_SOCKADDR_SIZE => {
                    if let Err(e) = transport::send_preamble(host_fd, &bytes) {
                        tracing::error!(pid, sockfd, error = %e, "failed to send connect preamble");
                    }
                }
                Ok(bytes) => {
                    tracing::error!(pid, sockfd, size = bytes.len(), "unexpected preamble size");
                }
                Err(e) => {
                    tracing::error!(pid, sockfd, error = %e, "failed to serialise local address");
                }
            }
        }

        let addfd = SeccompNotifAddfd {
            id: req.id,
            flags: SECCOMP_ADDFD_FLAG_SETFD,
            srcfd: host_fd as u32,
            newfd: req.data.args[0] as u32,
            newfd_flags: 0,
        };
        if let Err(e) = notif::addfd(self.fd, &addfd) {
            tracing::error!(pid, sockfd, error = %e, "fd injection failed");
            close_fd(host_fd);
            self.set_socket_state(pid, sockfd, SocketState::NotBypassable);
            return;
        }
        close_fd(host_fd);

        self.set_socket_state(pid, sockfd, SocketState::Bypassed);
        resp.succeed(0);
        tracing::info!(pid, sockfd, dst = %dst, "connect bypassed");
    }

    pub(crate) fn handle_setsockopt(&mut self, pid: i32, sockfd: i32, req: &SeccompNotif) {
        let level = req.data.args[1];
        let optname = req.data.args[2];
        let optlen = req.data.args[4];
        let optval = match self.read_proc_mem(pid, req.data.args[3], optlen) {
            Ok(val) => val,
            Err(e) => {
                tracing::error!(
                    pid,
                    sockfd,
                    level,
                    optname,
                    optlen,
                    error = %e,
                    "failed to read setsockopt value"
                );
                return;
            }
        };

        let option = SocketOption {
            level,
            optname,
            optval,
            optlen,
        };
        let Some(state) = self.socket_state(pid, sockfd) else {
            return;
        };
        self.with_socket(pid, sockfd, |sock| sock.socket_options.push(option.clone()));

        if state == SocketState::Binded || state == SocketState::Listening {
            self.apply_to_host_sockets(pid, sockfd, |fd| transport::apply_sockopt(fd, &option));
        }
        tracing::debug!(pid, sockfd, level, optname, optlen, "setsockopt recorded");
    }

    pub(crate) fn handle_fcntl(&mut self, pid: i32, sockfd: i32, req: &SeccompNotif) {
        let cmd = req.data.args[1];
        match cmd as i32 {
            libc::F_SETFD | libc::F_SETFL => {
                let option = FcntlOption {
                    cmd,
                    value: req.data.args[2],
                };
                let Some(state) = self.socket_state(pid, sockfd) else {
                    return;
                };
                self.with_socket(pid, sockfd, |sock| sock.fcntl_options.push(option));
                tracing::debug!(pid, sockfd, cmd, value = option.value, "fcntl recorded");

                if state == SocketState::Binded || state == SocketState::Listening {
                    self.apply_to_host_sockets(pid, sockfd, |fd| {
                        transport::apply_fcntl(fd, &option)
                    });
                }
            }
            libc::F_GETFL => {}
            other => {
                tracing::warn!(pid, sockfd, cmd = other, "unknown fcntl command ignored");
            }
        }
    }

    pub(crate) fn handle_getpeername(
        &mut self,
        pid: i32,
        sockfd: i32,
        req: &SeccompNotif,
        resp: &mut SeccompNotifResp,
    ) {
        let Some(addr) = self.socket_ref(pid, sockfd).map(|s| s.remote_vaddr.clone()) else {
            return;
        };
        if let Err(e) = self.write_sockaddr(pid, req.data.args[1], &addr) {
            tracing::error!(pid, sockfd, error = %e, "failed to write peer sockaddr");
            return;
        }
        resp.succeed(0);
        tracing::info!(pid, sockfd, addr = %addr, "reported virtual peer address");
    }

    pub(crate) fn handle_getsockname(
        &mut self,
        pid: i32,
        sockfd: i32,
        req: &SeccompNotif,
        resp: &mut SeccompNotifResp,
    ) {
        let Some(addr) = self.socket_ref(pid, sockfd).map(|s| s.local_vaddr.clone()) else {
            return;
        };
        if let Err(e) = self.write_sockaddr(pid, req.data.args[1], &addr) {
            tracing::error!(pid, sockfd, error = %e, "failed to write local sockaddr");
            return;
        }
        resp.succeed(0);
        tracing::info!(pid, sockfd, addr = %addr, "reported virtual local address");
    }

    /// Write an RDMA entry's IPv4 address back into the container's sockaddr
    /// buffer. Returns false (after logging) when the entry cannot be
    /// expressed or the write fails.
    fn write_rdma_addr(&mut self, pid: i32, offset: u64, entry: &Entry) -> bool {
        let TransportAddr::Rdma { family, addr, port } = &entry.address else {
            tracing::warn!(address = %entry.address, "RDMA signal from a non-RDMA entry");
            return false;
        };
        let sa = match Sockaddr::from_ip_port(*family, IpAddr::V4(*addr), *port, 0, 0) {
            Ok(sa) => sa,
            Err(e) => {
                tracing::warn!(error = %e, "failed to build RDMA sockaddr");
                return false;
            }
        };
        if let Err(e) = self.write_sockaddr(pid, offset, &sa) {
            tracing::warn!(error = %e, "failed to write RDMA sockaddr");
            return false;
        }
        true
    }

    /// Run `apply` against every host socket of the record, logging failures.
    fn apply_to_host_sockets(
        &mut self,
        pid: i32,
        sockfd: i32,
        apply: impl Fn(RawFd) -> tiaccoon_shared::TiaccoonResult<()>,
    ) {
        let Some(map) = self.socket_ref(pid, sockfd).map(|s| s.host_sockets.clone()) else {
            return;
        };
        let fds: Vec<RawFd> = map.lock().keys().copied().collect();
        for fd in fds {
            if let Err(e) = apply(fd) {
                tracing::error!(pid, sockfd, host_fd = fd, error = %e, "failed to configure host socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_defaults() {
        let record = SocketRecord::new(100, 7, libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP);
        assert_eq!(record.state, SocketState::NotBypassed);
        assert_eq!(record.local_vaddr, Sockaddr::zero());
        assert_eq!(record.remote_vaddr, Sockaddr::zero());
        assert!(record.socket_options.is_empty());
        assert!(record.host_sockets.lock().is_empty());
        assert!(!record.cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn test_teardown_sets_cancel_signals() {
        let mut record =
            SocketRecord::new(100, 7, libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP);
        let cancel = Arc::new(AtomicBool::new(false));
        // a host socket backed by a throwaway fd
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        record.host_sockets.lock().insert(
            fd,
            HostSocket {
                fd,
                entry: Arc::new(Entry {
                    vip: "10.0.10.50".parse().unwrap(),
                    vport: 80,
                    transport: crate::destination::TransportKind::Ipv4,
                    address: TransportAddr::ipv4("127.0.0.1".parse().unwrap(), 8080),
                }),
                state: HostSocketState::Binded,
                cancel: cancel.clone(),
            },
        );

        record.teardown();
        assert!(cancel.load(Ordering::SeqCst));
        assert!(record.cancel.load(Ordering::SeqCst));
        assert!(record.host_sockets.lock().is_empty());
    }

    #[test]
    fn test_accept_queue_capacity_and_back_pressure() {
        assert_eq!(ACCEPT_QUEUE_CAPACITY, 65535);
        let (tx, _rx) = mpsc::channel::<usize>(ACCEPT_QUEUE_CAPACITY);
        for i in 0..ACCEPT_QUEUE_CAPACITY {
            tx.try_send(i).unwrap();
        }
        assert!(matches!(
            tx.try_send(ACCEPT_QUEUE_CAPACITY),
            Err(mpsc::error::TrySendError::Full(_))
        ));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SocketState::NotBypassable.as_str(), "NotBypassable");
        assert_eq!(SocketState::Binded.as_str(), "Binded");
        assert_eq!(SocketState::Bypassed.as_str(), "Bypassed");
    }
}
