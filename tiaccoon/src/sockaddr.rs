//! Raw sockaddr codec.
//!
//! Address arguments of trapped syscalls are read out of the container
//! process's memory as raw `sockaddr_in`/`sockaddr_in6` byte images and
//! written back the same way. Layout follows the kernel structs: the family
//! field is native-endian, the port network-endian.

use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tiaccoon_shared::{TiaccoonError, TiaccoonResult};

/// Size of the `sockaddr_in` image exchanged as the connect-preamble on a
/// bypassed connection.
pub const VIRTUAL_SOCKADDR_SIZE: usize = mem::size_of::<libc::sockaddr_in>();

const SOCKADDR_IN6_SIZE: usize = mem::size_of::<libc::sockaddr_in6>();

/// A decoded IPv4/IPv6 socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sockaddr {
    pub family: u16,
    pub ip: IpAddr,
    pub port: u16,
    /// `sin6_flowinfo`; zero for IPv4.
    pub flowinfo: u32,
    /// `sin6_scope_id`; zero for IPv4.
    pub scope_id: u32,
}

impl Sockaddr {
    /// The all-zero IPv4 address, used before a record has observed a real
    /// local or remote address.
    pub fn zero() -> Self {
        Sockaddr {
            family: libc::AF_INET as u16,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            flowinfo: 0,
            scope_id: 0,
        }
    }

    /// Decode a raw sockaddr byte image. Accepts `AF_INET` and `AF_INET6`.
    pub fn parse(buf: &[u8]) -> TiaccoonResult<Self> {
        if buf.len() < 2 {
            return Err(TiaccoonError::Parse(format!(
                "sockaddr too short: {} bytes",
                buf.len()
            )));
        }
        let family = u16::from_ne_bytes([buf[0], buf[1]]);
        match i32::from(family) {
            libc::AF_INET => {
                if buf.len() < VIRTUAL_SOCKADDR_SIZE {
                    return Err(TiaccoonError::Parse(format!(
                        "sockaddr_in too short: {} bytes",
                        buf.len()
                    )));
                }
                let port = u16::from_be_bytes([buf[2], buf[3]]);
                let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
                Ok(Sockaddr {
                    family,
                    ip: IpAddr::V4(ip),
                    port,
                    flowinfo: 0,
                    scope_id: 0,
                })
            }
            libc::AF_INET6 => {
                if buf.len() < SOCKADDR_IN6_SIZE {
                    return Err(TiaccoonError::Parse(format!(
                        "sockaddr_in6 too short: {} bytes",
                        buf.len()
                    )));
                }
                let port = u16::from_be_bytes([buf[2], buf[3]]);
                let flowinfo = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[8..24]);
                let scope_id = u32::from_ne_bytes([buf[24], buf[25], buf[26], buf[27]]);
                Ok(Sockaddr {
                    family,
                    ip: IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                    flowinfo,
                    scope_id,
                })
            }
            other => Err(TiaccoonError::Parse(format!(
                "expected AF_INET or AF_INET6, got {}",
                other
            ))),
        }
    }

    /// Build an address from parts. The family decides whether the IP is
    /// narrowed to 4 bytes or widened to 16.
    pub fn from_ip_port(
        family: u16,
        ip: IpAddr,
        port: u16,
        flowinfo: u32,
        scope_id: u32,
    ) -> TiaccoonResult<Self> {
        match i32::from(family) {
            libc::AF_INET => {
                let v4 = match ip {
                    IpAddr::V4(v4) => v4,
                    IpAddr::V6(v6) => v6.to_ipv4_mapped().ok_or_else(|| {
                        TiaccoonError::Parse(format!("{} is not representable as IPv4", v6))
                    })?,
                };
                Ok(Sockaddr {
                    family,
                    ip: IpAddr::V4(v4),
                    port,
                    flowinfo: 0,
                    scope_id: 0,
                })
            }
            libc::AF_INET6 => {
                let v6 = match ip {
                    IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                    IpAddr::V6(v6) => v6,
                };
                Ok(Sockaddr {
                    family,
                    ip: IpAddr::V6(v6),
                    port,
                    flowinfo,
                    scope_id,
                })
            }
            other => Err(TiaccoonError::Parse(format!(
                "expected AF_INET or AF_INET6, got {}",
                other
            ))),
        }
    }

    /// Encode back into the raw kernel byte image.
    pub fn to_bytes(&self) -> TiaccoonResult<Vec<u8>> {
        match (i32::from(self.family), &self.ip) {
            (libc::AF_INET, IpAddr::V4(v4)) => {
                let mut buf = vec![0u8; VIRTUAL_SOCKADDR_SIZE];
                buf[0..2].copy_from_slice(&self.family.to_ne_bytes());
                buf[2..4].copy_from_slice(&self.port.to_be_bytes());
                buf[4..8].copy_from_slice(&v4.octets());
                Ok(buf)
            }
            (libc::AF_INET6, IpAddr::V6(v6)) => {
                let mut buf = vec![0u8; SOCKADDR_IN6_SIZE];
                buf[0..2].copy_from_slice(&self.family.to_ne_bytes());
                buf[2..4].copy_from_slice(&self.port.to_be_bytes());
                buf[4..8].copy_from_slice(&self.flowinfo.to_ne_bytes());
                buf[8..24].copy_from_slice(&v6.octets());
                buf[24..28].copy_from_slice(&self.scope_id.to_ne_bytes());
                Ok(buf)
            }
            (family, ip) => Err(TiaccoonError::Parse(format!(
                "family {} does not match address {}",
                family, ip
            ))),
        }
    }
}

impl fmt::Display for Sockaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Extract the filesystem path out of a raw `sockaddr_un` byte image.
pub fn unix_path(buf: &[u8]) -> TiaccoonResult<String> {
    if buf.len() < 2 {
        return Err(TiaccoonError::Parse(format!(
            "sockaddr_un too short: {} bytes",
            buf.len()
        )));
    }
    let family = u16::from_ne_bytes([buf[0], buf[1]]);
    if i32::from(family) != libc::AF_UNIX {
        return Err(TiaccoonError::Parse(format!(
            "expected AF_UNIX, got {}",
            family
        )));
    }
    let path = &buf[2..];
    let end = path.iter().position(|&b| b == 0).unwrap_or(path.len());
    String::from_utf8(path[..end].to_vec())
        .map_err(|e| TiaccoonError::Parse(format!("socket path is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_round_trip() {
        let sa = Sockaddr::from_ip_port(
            libc::AF_INET as u16,
            IpAddr::V4(Ipv4Addr::new(10, 0, 10, 50)),
            80,
            0,
            0,
        )
        .unwrap();
        let bytes = sa.to_bytes().unwrap();
        assert_eq!(bytes.len(), VIRTUAL_SOCKADDR_SIZE);
        let parsed = Sockaddr::parse(&bytes).unwrap();
        assert_eq!(parsed, sa);
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.to_string(), "10.0.10.50:80");
    }

    #[test]
    fn test_ipv4_wire_layout() {
        let sa = Sockaddr::from_ip_port(
            libc::AF_INET as u16,
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            8080,
            0,
            0,
        )
        .unwrap();
        let bytes = sa.to_bytes().unwrap();
        // port 8080 = 0x1F90, network byte order
        assert_eq!(&bytes[2..4], &[0x1F, 0x90]);
        assert_eq!(&bytes[4..8], &[127, 0, 0, 1]);
    }

    #[test]
    fn test_ipv6_round_trip() {
        let sa = Sockaddr::from_ip_port(
            libc::AF_INET6 as u16,
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            443,
            7,
            3,
        )
        .unwrap();
        let bytes = sa.to_bytes().unwrap();
        assert_eq!(bytes.len(), SOCKADDR_IN6_SIZE);
        let parsed = Sockaddr::parse(&bytes).unwrap();
        assert_eq!(parsed, sa);
        assert_eq!(parsed.flowinfo, 7);
        assert_eq!(parsed.scope_id, 3);
    }

    #[test]
    fn test_parse_rejects_unknown_family() {
        let mut buf = vec![0u8; VIRTUAL_SOCKADDR_SIZE];
        buf[0..2].copy_from_slice(&(libc::AF_PACKET as u16).to_ne_bytes());
        assert!(Sockaddr::parse(&buf).is_err());
    }

    #[test]
    fn test_unix_path() {
        let mut buf = vec![0u8; 110];
        buf[0..2].copy_from_slice(&(libc::AF_UNIX as u16).to_ne_bytes());
        buf[2..27].copy_from_slice(b"tiaccoon-rsocket-control\0");
        assert_eq!(unix_path(&buf).unwrap(), "tiaccoon-rsocket-control");
    }

    #[test]
    fn test_unix_path_wrong_family() {
        let mut buf = vec![0u8; 16];
        buf[0..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
        assert!(unix_path(&buf).is_err());
    }

    #[test]
    fn test_zero_sockaddr() {
        let sa = Sockaddr::zero();
        assert_eq!(sa.to_string(), "0.0.0.0:0");
        assert_eq!(sa.to_bytes().unwrap().len(), VIRTUAL_SOCKADDR_SIZE);
    }
}
