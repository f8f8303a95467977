//! RDMA transport adapter.
//!
//! The data path is realised by the RDMA library inside the container, not
//! by a host socket. Both operations signal the handler to rewrite the
//! container's sockaddr and let the library take over through the control
//! channel; the carried length is what the rewritten sockaddr occupies.

use std::os::unix::io::RawFd;

use tiaccoon_shared::{TiaccoonError, TiaccoonResult};

use crate::destination::Entry;
use crate::sockaddr::VIRTUAL_SOCKADDR_SIZE;

use super::socket::SocketRecord;

pub(crate) fn connect(_sock: &SocketRecord, _entry: &Entry) -> TiaccoonResult<RawFd> {
    Err(TiaccoonError::TryRdma {
        addrlen: VIRTUAL_SOCKADDR_SIZE as u64,
    })
}

pub(crate) fn bind(_sock: &SocketRecord, _entry: &Entry) -> TiaccoonResult<RawFd> {
    Err(TiaccoonError::TryRdma {
        addrlen: VIRTUAL_SOCKADDR_SIZE as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{TransportAddr, TransportKind};

    #[test]
    fn test_both_operations_signal_rdma() {
        let sock = SocketRecord::new(1, 3, libc::AF_INET, libc::SOCK_STREAM, 0);
        let entry = Entry {
            vip: "10.0.10.50".parse().unwrap(),
            vport: 12865,
            transport: TransportKind::Rdma,
            address: TransportAddr::rdma("192.168.20.30".parse().unwrap(), 12865),
        };
        let err = connect(&sock, &entry).unwrap_err();
        assert!(err.is_try_rdma());
        match bind(&sock, &entry).unwrap_err() {
            TiaccoonError::TryRdma { addrlen } => {
                assert_eq!(addrlen, VIRTUAL_SOCKADDR_SIZE as u64)
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
