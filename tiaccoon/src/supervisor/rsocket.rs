//! RDMA control channel.
//!
//! The in-container RDMA library connects an `AF_UNIX` stream socket to a
//! magic path. The connect handler swaps that fd for one end of a
//! socketpair and answers a small command protocol on the other end:
//! 64-byte frames whose first four bytes are the command.

use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use nix::sys::socket::{recv, send, socketpair, AddressFamily, MsgFlags, SockFlag, SockType};

use tiaccoon_shared::{TiaccoonError, TiaccoonResult};

use crate::policy::PolicyTable;
use crate::sockaddr::{self, Sockaddr};

use super::close_fd;
use super::notif::{self, SeccompNotif, SeccompNotifAddfd, SeccompNotifResp, SECCOMP_ADDFD_FLAG_SETFD};
use super::socket::SocketState;
use super::worker::NotifWorker;

/// The path the container-side RDMA library connects to.
pub(crate) const RSOCKET_CONTROL_PATH: &str = "tiaccoon-rsocket-control";

/// Fixed size of a control frame.
pub(crate) const FRAME_SIZE: usize = 64;

impl NotifWorker {
    /// Pre-check run on every `connect` while the RDMA feature is enabled.
    /// Returns true when the connect was taken over as a control-channel
    /// setup; the caller skips all remaining connect logic in that case.
    pub(crate) fn try_init_rsocket(
        &mut self,
        pid: i32,
        sockfd: i32,
        req: &SeccompNotif,
        resp: &mut SeccompNotifResp,
    ) -> bool {
        let Some((domain, sock_type, record_pid, cancel)) = self
            .socket_ref(pid, sockfd)
            .map(|s| (s.sock_domain, s.sock_type, s.pid, s.cancel.clone()))
        else {
            return false;
        };
        if domain != libc::AF_UNIX || sock_type != libc::SOCK_STREAM {
            return false;
        }

        let buf = match self.read_proc_mem(record_pid, req.data.args[1], req.data.args[2]) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::error!(pid, sockfd, error = %e, "failed to read connect sockaddr");
                return false;
            }
        };
        let path = match sockaddr::unix_path(&buf) {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(pid, sockfd, error = %e, "failed to parse UNIX sockaddr");
                return false;
            }
        };
        if path != RSOCKET_CONTROL_PATH {
            tracing::debug!(pid, sockfd, %path, "not the rsocket control path");
            return false;
        }
        tracing::info!(pid, sockfd, %path, "setting up rsocket control channel");

        let (agent_end, container_end) = match socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        ) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(pid, sockfd, error = %e, "failed to create control socketpair");
                return false;
            }
        };

        let policy = self.access.server.clone();
        let my_vip = self.my_vip;
        let agent_fd = agent_end.into_raw_fd();
        let spawned = thread::Builder::new()
            .name(format!("rsocket-{}", agent_fd))
            .spawn(move || run_control_channel(agent_fd, policy, my_vip, cancel));
        if let Err(e) = spawned {
            tracing::error!(pid, sockfd, error = %e, "failed to spawn rsocket servicer");
            close_fd(agent_fd);
            return false;
        }

        let addfd = SeccompNotifAddfd {
            id: req.id,
            flags: SECCOMP_ADDFD_FLAG_SETFD,
            srcfd: container_end.as_raw_fd() as u32,
            newfd: req.data.args[0] as u32,
            newfd_flags: 0,
        };
        if let Err(e) = notif::addfd(self.fd, &addfd) {
            tracing::error!(pid, sockfd, error = %e, "fd injection failed");
            self.set_socket_state(pid, sockfd, SocketState::NotBypassable);
            // dropping container_end closes the pair; the servicer exits on EOF
            return false;
        }
        drop(container_end);

        self.set_socket_state(pid, sockfd, SocketState::Bypassed);
        resp.succeed(0);
        tracing::info!(pid, sockfd, "connect bypassed onto rsocket control channel");
        true
    }
}

/// Servicer loop for one control channel. Exits on peer EOF or record
/// cancellation; transient errors are logged and the loop continues.
fn run_control_channel(
    fd: RawFd,
    policy: Arc<PolicyTable>,
    my_vip: IpAddr,
    cancel: Arc<AtomicBool>,
) {
    let mut buf = [0u8; FRAME_SIZE];
    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        let n = match recv(fd, &mut buf, MsgFlags::empty()) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::error!(fd, error = %e, "failed to read control frame");
                continue;
            }
        };
        let reply = handle_frame(&buf[..n], &policy, my_vip);
        tracing::debug!(fd, reply = %String::from_utf8_lossy(&reply[..2.min(reply.len())]), "control frame handled");
        if let Err(e) = send(fd, &reply, MsgFlags::empty()) {
            tracing::error!(fd, error = %e, "failed to write control reply");
            continue;
        }
    }
    close_fd(fd);
}

/// Decode one control frame and produce the reply.
pub(crate) fn handle_frame(frame: &[u8], policy: &PolicyTable, my_vip: IpAddr) -> Vec<u8> {
    if frame.len() < 4 {
        tracing::error!(len = frame.len(), "short control frame");
        return b"ER".to_vec();
    }
    let reply = match &frame[..4] {
        b"PING" => Ok(b"OK".to_vec()),
        b"MVIP" => my_vip_reply(my_vip),
        b"ACON" => access_reply(frame, policy),
        other => {
            tracing::error!(cmd = %String::from_utf8_lossy(other), "unexpected control command");
            return b"ER".to_vec();
        }
    };
    match reply {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!(error = %e, "failed to handle control frame");
            b"ER".to_vec()
        }
    }
}

/// `MVIP`: the agent's VIP as an `AF_INET` sockaddr, port zero.
fn my_vip_reply(my_vip: IpAddr) -> TiaccoonResult<Vec<u8>> {
    let sa = Sockaddr::from_ip_port(libc::AF_INET as u16, my_vip, 0, 0, 0)?;
    let mut reply = b"OK".to_vec();
    reply.extend(sa.to_bytes()?);
    Ok(reply)
}

/// `ACON`: bytes 4..20 carry a sockaddr; answer with the server-side policy
/// for its IP.
fn access_reply(frame: &[u8], policy: &PolicyTable) -> TiaccoonResult<Vec<u8>> {
    if frame.len() < 20 {
        return Err(TiaccoonError::Parse(format!(
            "short ACON frame: {} bytes",
            frame.len()
        )));
    }
    let sa = Sockaddr::parse(&frame[4..20])?;
    match policy.check(sa.ip) {
        Ok(()) => Ok(b"OK".to_vec()),
        Err(TiaccoonError::PolicyDenied) => Ok(b"NO".to_vec()),
        Err(e) => Err(e),
    }
}
