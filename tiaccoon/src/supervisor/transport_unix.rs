//! UNIX domain transport adapter.

use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use nix::errno::Errno;

use tiaccoon_shared::{TiaccoonError, TiaccoonResult};

use crate::destination::{Entry, TransportAddr, TransportKind};

use super::close_fd;
use super::socket::SocketRecord;
use super::transport::{configure_socket, cvt, recv_peer_vaddr};

fn unix_path_of(entry: &Entry) -> TiaccoonResult<&str> {
    match &entry.address {
        TransportAddr::Unix { path } => Ok(path),
        other => Err(TiaccoonError::Internal(format!(
            "UNIX transport with address {}",
            other
        ))),
    }
}

fn sockaddr_un_for(path: &str) -> TiaccoonResult<(libc::sockaddr_un, libc::socklen_t)> {
    let mut sa: libc::sockaddr_un = unsafe { mem::zeroed() };
    sa.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() >= sa.sun_path.len() {
        return Err(TiaccoonError::Parse(format!(
            "socket path too long ({} bytes): {}",
            bytes.len(),
            path
        )));
    }
    for (i, b) in bytes.iter().enumerate() {
        sa.sun_path[i] = *b as libc::c_char;
    }
    let len = (mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
    Ok((sa, len))
}

fn new_unix_socket() -> TiaccoonResult<RawFd> {
    let fd = cvt(unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) })
        .map_err(|e| TiaccoonError::Syscall(format!("creating UNIX socket: {}", e)))?;
    Ok(fd)
}

pub(crate) fn connect(sock: &SocketRecord, entry: &Entry) -> TiaccoonResult<RawFd> {
    let path = unix_path_of(entry)?;
    let (sa, len) = sockaddr_un_for(path)?;

    let fd = new_unix_socket()?;
    tracing::debug!(host_fd = fd, "created host socket");

    if let Err(e) = configure_socket(fd, sock) {
        close_fd(fd);
        return Err(e);
    }

    let rc = unsafe {
        libc::connect(
            fd,
            &sa as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        let errno = Errno::last();
        close_fd(fd);
        return Err(TiaccoonError::Syscall(format!(
            "connect to {}: {}",
            path, errno
        )));
    }
    Ok(fd)
}

pub(crate) fn bind(sock: &SocketRecord, entry: &Entry) -> TiaccoonResult<RawFd> {
    let path = unix_path_of(entry)?;
    let (sa, len) = sockaddr_un_for(path)?;

    // a stale socket file would make bind fail with EADDRINUSE
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(TiaccoonError::Syscall(format!(
                "removing stale socket file {}: {}",
                path, e
            )));
        }
    }

    let fd = new_unix_socket()?;
    tracing::debug!(host_fd = fd, "created host socket");

    if let Err(e) = configure_socket(fd, sock) {
        close_fd(fd);
        return Err(e);
    }

    let rc = unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        let errno = Errno::last();
        close_fd(fd);
        return Err(TiaccoonError::Syscall(format!("bind to {}: {}", path, errno)));
    }
    Ok(fd)
}

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

    if i32::from(storage.ss_family) != libc::AF_UNIX {
        close_fd(fd);
        return Err(TiaccoonError::Parse(format!(
            "accepted peer family {} is not AF_UNIX",
            storage.ss_family
        )));
    }
    // Unnamed client sockets report an empty path.
    let sun = unsafe { &*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_un) };
    let path_len = (len as usize).saturating_sub(mem::size_of::<libc::sa_family_t>());
    let peer_path: String = sun.sun_path[..path_len.min(sun.sun_path.len())]
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8 as char)
        .collect();

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
            transport: TransportKind::Unix,
            address: TransportAddr::unix(peer_path),
        },
    ))
}
