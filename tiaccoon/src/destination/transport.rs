//! Transport kinds and addresses for destination entries.

use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;

/// Supported transports, declared in priority order: when several transports
/// can reach a destination, the earlier kind is tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransportKind {
    Unix,
    Rdma,
    Ipv6,
    Ipv4,
}

impl TransportKind {
    /// Number of transport kinds; sizes the per-destination bucket vector.
    pub const COUNT: usize = 4;

    /// All kinds in priority order.
    pub const PRIORITY: [TransportKind; Self::COUNT] = [
        TransportKind::Unix,
        TransportKind::Rdma,
        TransportKind::Ipv6,
        TransportKind::Ipv4,
    ];

    /// Position of this kind in the bucket vector.
    pub fn index(self) -> usize {
        match self {
            TransportKind::Unix => 0,
            TransportKind::Rdma => 1,
            TransportKind::Ipv6 => 2,
            TransportKind::Ipv4 => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Unix => "UNIX",
            TransportKind::Rdma => "RDMA",
            TransportKind::Ipv6 => "IPv6",
            TransportKind::Ipv4 => "IPv4",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete host endpoint, one variant per transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddr {
    Ipv4 { addr: Ipv4Addr, port: u16 },
    Unix { path: String },
    /// RDMA control endpoints carry an IPv4 address today; the family field
    /// is kept so the sockaddr written back into the container names it.
    Rdma { family: u16, addr: Ipv4Addr, port: u16 },
}

impl TransportAddr {
    pub fn ipv4(addr: Ipv4Addr, port: u16) -> Self {
        TransportAddr::Ipv4 { addr, port }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        TransportAddr::Unix { path: path.into() }
    }

    pub fn rdma(addr: Ipv4Addr, port: u16) -> Self {
        TransportAddr::Rdma {
            family: libc::AF_INET as u16,
            addr,
            port,
        }
    }

    /// Compact byte form: 4 address bytes plus a big-endian port for IP-like
    /// transports, the raw path bytes for UNIX.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            TransportAddr::Ipv4 { addr, port } | TransportAddr::Rdma { addr, port, .. } => {
                let o = addr.octets();
                vec![o[0], o[1], o[2], o[3], (port >> 8) as u8, *port as u8]
            }
            TransportAddr::Unix { path } => path.as_bytes().to_vec(),
        }
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddr::Ipv4 { addr, port } => write!(f, "{}:{}", addr, port),
            TransportAddr::Unix { path } => f.write_str(path),
            TransportAddr::Rdma { addr, port, .. } => write!(f, "{}:{}", addr, port),
        }
    }
}

impl Serialize for TransportAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert_eq!(
            TransportKind::PRIORITY,
            [
                TransportKind::Unix,
                TransportKind::Rdma,
                TransportKind::Ipv6,
                TransportKind::Ipv4
            ]
        );
        for (i, kind) in TransportKind::PRIORITY.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn test_ipv4_addr_bytes() {
        let addr = TransportAddr::ipv4(Ipv4Addr::new(127, 0, 0, 1), 8080);
        assert_eq!(addr.to_bytes(), vec![127, 0, 0, 1, 0x1F, 0x90]);
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_unix_addr_bytes() {
        let addr = TransportAddr::unix("/run/app.sock");
        assert_eq!(addr.to_bytes(), b"/run/app.sock".to_vec());
        assert_eq!(addr.to_string(), "/run/app.sock");
    }

    #[test]
    fn test_rdma_addr_family() {
        let addr = TransportAddr::rdma(Ipv4Addr::new(192, 168, 20, 30), 12865);
        match addr {
            TransportAddr::Rdma { family, .. } => assert_eq!(family, libc::AF_INET as u16),
            _ => unreachable!(),
        }
    }
}
