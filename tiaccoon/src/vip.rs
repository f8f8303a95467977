//! Virtual-IP table key codec.
//!
//! The access-control and destination tables are keyed by the virtual IP
//! split into an `(upper, lower)` pair of u64s. An IPv4 address and its
//! IPv4-mapped IPv6 form (`::ffff:a.b.c.d`) produce the same key so that
//! entries match regardless of which form a sockaddr carried.

use std::net::IpAddr;

/// Split an IP address into the `(upper, lower)` table key.
pub fn ip_key(ip: &IpAddr) -> (u64, u64) {
    match ip {
        IpAddr::V4(v4) => (0, u64::from(u32::from_be_bytes(v4.octets()))),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            let upper = u64::from_be_bytes([o[0], o[1], o[2], o[3], o[4], o[5], o[6], o[7]]);
            if upper == 0 && o[10] == 0xff && o[11] == 0xff {
                // IPv4-mapped IPv6 address
                let lower = u64::from(u32::from_be_bytes([o[12], o[13], o[14], o[15]]));
                (0, lower)
            } else {
                let lower =
                    u64::from_be_bytes([o[8], o[9], o[10], o[11], o[12], o[13], o[14], o[15]]);
                (upper, lower)
            }
        }
    }
}

/// Whether two addresses denote the same host, treating an IPv4 address and
/// its IPv4-mapped IPv6 form as equal.
pub fn ip_eq(a: &IpAddr, b: &IpAddr) -> bool {
    ip_key(a) == ip_key(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_ipv4_key() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 10, 50));
        assert_eq!(ip_key(&ip), (0, 0x0A000A32));
    }

    #[test]
    fn test_ipv4_mapped_key_matches_ipv4() {
        let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 10, 50));
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 10, 50).to_ipv6_mapped());
        assert_eq!(ip_key(&mapped), (0, 0x0A000A32));
        assert!(ip_eq(&v4, &mapped));
    }

    #[test]
    fn test_plain_ipv6_key() {
        let ip = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        let (upper, lower) = ip_key(&ip);
        assert_eq!(upper, 0x2001_0db8_0000_0000);
        assert_eq!(lower, 1);
    }

    #[test]
    fn test_unspecified_v6_is_not_mapped() {
        let ip = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
        assert_eq!(ip_key(&ip), (0, 0));
    }
}
