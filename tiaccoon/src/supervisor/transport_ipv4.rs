//! IPv4 transport adapter.

use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use nix::errno::Errno;

use tiaccoon_shared::{TiaccoonError, TiaccoonResult};

use crate::destination::{Entry, TransportAddr, TransportKind};

use super::close_fd;
use super::socket::SocketRecord;
use super::transport::{configure_socket, cvt, recv_peer_vaddr};

fn sockaddr_in_for(addr: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        sin_zero: [0; 8],
    }
}

fn ipv4_address(entry: &Entry) -> TiaccoonResult<(Ipv4Addr, u16)> {
    match &entry.address {
        TransportAddr::Ipv4 { addr, port } => Ok((*addr, *port)),
        other => Err(TiaccoonError::Internal(format!(
            "IPv4 transport with address {}",
            other
        ))),
    }
}

fn new_tcp_socket() -> TiaccoonResult<RawFd> {
    let fd = cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP) })
        .map_err(|e| TiaccoonError::Syscall(format!("creating IPv4 socket: {}", e)))?;
    Ok(fd)
}

pub(crate) fn connect(sock: &SocketRecord, entry: &Entry) -> TiaccoonResult<RawFd> {
    let (addr, port) = ipv4_address(entry)?;
    let fd = new_tcp_socket()?;
    tracing::debug!(host_fd = fd, "created host socket");

    if let Err(e) = configure_socket(fd, sock) {
        close_fd(fd);
        return Err(e);
    }

    let sa = sockaddr_in_for(addr, port);
    let rc = unsafe {
        libc::connect(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let errno = Errno::last();
        close_fd(fd);
        return Err(TiaccoonError::Syscall(format!(
            "connect to {}:{}: {}",
            addr, port, errno
        )));
    }
    Ok(fd)
}

pub(crate) fn bind(sock: &SocketRecord, entry: &Entry) -> TiaccoonResult<RawFd> {
    let (addr, port) = ipv4_address(entry)?;
    let fd = new_tcp_socket()?;
    tracing::debug!(host_fd = fd, "created host socket");

    if let Err(e) = configure_socket(fd, sock) {
        close_fd(fd);
        return Err(e);
    }

    let sa = sockaddr_in_for(addr, port);
    let rc = unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let errno = Errno::last();
        close_fd(fd);
        return Err(TiaccoonError::Syscall(format!(
            "bind to {}:{}: {}",
            addr, port, errno
        )));
    }
    Ok(fd)
}

/// Accept one connection and read its preamble. The returned entry names the
/// peer's virtual identity and real address.
pub(crate) fn accept(listen_fd: RawFd) -> TiaccoonResult<(RawFd, Entry)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = cvt(unsafe {
        libc::accept(
            listen_fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    })
    .map_err(|e| TiaccoonError::Syscall(format!("accept: {}", e)))?;

    if i32::from(storage.ss_family) != libc::AF_INET {
        close_fd(fd);
        return Err(TiaccoonError::Parse(format!(
            "accepted peer family {} is not AF_INET",
            storage.ss_family
        )));
    }
    let sin = unsafe { &*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
    let peer_addr = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
    let peer_port = u16::from_be(sin.sin_port);

    let vaddr = match recv_peer_vaddr(fd) {
        Ok(vaddr) => vaddr,
        Err(e) => {
            close_fd(fd);
            return Err(TiaccoonError::Parse(format!(
                "receiving peer virtual address: {}",
                e
            )));
        }
    };

    Ok((
        fd,
        Entry {
            vip: vaddr.ip,
            vport: vaddr.port,
            transport: TransportKind::Ipv4,
            address: TransportAddr::ipv4(peer_addr, peer_port),
        },
    ))
}
