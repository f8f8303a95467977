//! Destination table.
//!
//! Resolves a virtual `(VIP, VPort)` seen inside a container into the
//! concrete host endpoints that realise it, grouped by transport priority.
//! A second index keyed by VPort alone lists the agent's own entries, the
//! ones a container `bind` on this host should be served by.

mod transport;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::vip;

pub use transport::{TransportAddr, TransportKind};

/// One resolved destination: the virtual identity and the host endpoint
/// backing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    #[serde(serialize_with = "ser_ip")]
    pub vip: IpAddr,
    pub vport: u16,
    pub transport: TransportKind,
    pub address: TransportAddr,
}

fn ser_ip<S: serde::Serializer>(ip: &IpAddr, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(ip)
}

/// Entries for one `(VIP, VPort)`, bucketed by transport priority index.
pub type TransportBuckets = Vec<Vec<Arc<Entry>>>;

#[derive(Debug, Default)]
struct Indexes {
    // client[vip upper][vip lower][vport][transport index]
    client: HashMap<u64, HashMap<u64, HashMap<u16, TransportBuckets>>>,
    // server[vport]; entries whose VIP is the agent's own
    server: HashMap<u16, Vec<Arc<Entry>>>,
}

/// The lookup surface the engine consults to resolve virtual endpoints.
#[derive(Debug)]
pub struct DestinationTable {
    my_vip: IpAddr,
    feature_rdma: bool,
    indexes: RwLock<Indexes>,
}

impl DestinationTable {
    pub fn new(my_vip: IpAddr, feature_rdma: bool) -> Self {
        DestinationTable {
            my_vip,
            feature_rdma,
            indexes: RwLock::new(Indexes::default()),
        }
    }

    /// Register a destination. The entry joins the server index iff its VIP
    /// equals the agent's VIP. RDMA entries are refused while the RDMA
    /// feature is off.
    pub fn upsert(&self, ip: IpAddr, port: u16, transport: TransportKind, address: TransportAddr) {
        if !self.feature_rdma && transport == TransportKind::Rdma {
            tracing::debug!(%ip, port, "refusing RDMA destination: feature disabled");
            return;
        }

        let entry = Arc::new(Entry {
            vip: ip,
            vport: port,
            transport,
            address,
        });
        let (upper, lower) = vip::ip_key(&ip);

        let mut idx = self.indexes.write();
        let buckets = idx
            .client
            .entry(upper)
            .or_default()
            .entry(lower)
            .or_default()
            .entry(port)
            .or_insert_with(|| vec![Vec::new(); TransportKind::COUNT]);
        buckets[transport.index()].push(entry.clone());

        if vip::ip_eq(&ip, &self.my_vip) {
            idx.server.entry(port).or_default().push(entry.clone());
        }

        tracing::info!(
            entry = %serde_json::to_string(&*entry).unwrap_or_default(),
            "destination upserted"
        );
    }

    /// Drop every entry for `(ip, port)` from both indexes.
    pub fn remove(&self, ip: IpAddr, port: u16) {
        let (upper, lower) = vip::ip_key(&ip);

        let mut idx = self.indexes.write();
        if let Some(per_lower) = idx.client.get_mut(&upper) {
            if let Some(per_port) = per_lower.get_mut(&lower) {
                per_port.remove(&port);
            }
        }
        if vip::ip_eq(&ip, &self.my_vip) {
            idx.server.remove(&port);
        }

        tracing::info!(%ip, port, "destination removed");
    }

    /// Entries reaching `(ip, port)`, grouped by transport priority. `None`
    /// when the destination is unknown.
    pub fn get_client(&self, ip: IpAddr, port: u16) -> Option<TransportBuckets> {
        let (upper, lower) = vip::ip_key(&ip);
        let idx = self.indexes.read();
        let buckets = idx.client.get(&upper)?.get(&lower)?.get(&port)?;
        Some(buckets.clone())
    }

    /// The agent's own entries for `port`, the ones backing a container
    /// `bind` on that virtual port.
    pub fn get_server(&self, port: u16) -> Option<Vec<Arc<Entry>>> {
        let idx = self.indexes.read();
        let entries = idx.server.get(&port)?;
        if entries.is_empty() {
            return None;
        }
        Some(entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn table() -> DestinationTable {
        DestinationTable::new(ip("10.0.10.40"), false)
    }

    #[test]
    fn test_upsert_then_get_client() {
        let t = table();
        t.upsert(
            ip("10.0.10.50"),
            80,
            TransportKind::Ipv4,
            TransportAddr::ipv4(Ipv4Addr::new(127, 0, 0, 1), 8080),
        );

        let buckets = t.get_client(ip("10.0.10.50"), 80).unwrap();
        assert_eq!(buckets.len(), TransportKind::COUNT);
        assert_eq!(buckets[TransportKind::Ipv4.index()].len(), 1);
        assert!(buckets[TransportKind::Unix.index()].is_empty());
        assert_eq!(
            buckets[TransportKind::Ipv4.index()][0].address,
            TransportAddr::ipv4(Ipv4Addr::new(127, 0, 0, 1), 8080)
        );
    }

    #[test]
    fn test_own_vip_joins_server_index() {
        let t = table();
        t.upsert(
            ip("10.0.10.40"),
            80,
            TransportKind::Ipv4,
            TransportAddr::ipv4(Ipv4Addr::UNSPECIFIED, 8080),
        );
        t.upsert(
            ip("10.0.10.50"),
            80,
            TransportKind::Ipv4,
            TransportAddr::ipv4(Ipv4Addr::new(127, 0, 0, 1), 8080),
        );

        let server = t.get_server(80).unwrap();
        assert_eq!(server.len(), 1);
        assert_eq!(server[0].vip, ip("10.0.10.40"));
        assert!(t.get_server(81).is_none());
    }

    #[test]
    fn test_mapped_vip_matches_agent_vip() {
        let t = table();
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 10, 40).to_ipv6_mapped());
        t.upsert(
            mapped,
            443,
            TransportKind::Ipv4,
            TransportAddr::ipv4(Ipv4Addr::UNSPECIFIED, 8443),
        );
        assert!(t.get_server(443).is_some());
    }

    #[test]
    fn test_remove_clears_both_indexes() {
        let t = table();
        t.upsert(
            ip("10.0.10.40"),
            80,
            TransportKind::Ipv4,
            TransportAddr::ipv4(Ipv4Addr::UNSPECIFIED, 8080),
        );
        t.remove(ip("10.0.10.40"), 80);
        assert!(t.get_client(ip("10.0.10.40"), 80).is_none());
        assert!(t.get_server(80).is_none());
    }

    #[test]
    fn test_rdma_refused_when_feature_off() {
        let t = table();
        t.upsert(
            ip("10.0.10.50"),
            12865,
            TransportKind::Rdma,
            TransportAddr::rdma(Ipv4Addr::new(192, 168, 20, 30), 12865),
        );
        assert!(t.get_client(ip("10.0.10.50"), 12865).is_none());
    }

    #[test]
    fn test_rdma_accepted_when_feature_on() {
        let t = DestinationTable::new(ip("10.0.10.40"), true);
        t.upsert(
            ip("10.0.10.50"),
            12865,
            TransportKind::Rdma,
            TransportAddr::rdma(Ipv4Addr::new(192, 168, 20, 30), 12865),
        );
        let buckets = t.get_client(ip("10.0.10.50"), 12865).unwrap();
        assert_eq!(buckets[TransportKind::Rdma.index()].len(), 1);
    }

    #[test]
    fn test_transport_groups_keep_priority_slots() {
        let t = table();
        t.upsert(
            ip("10.0.10.50"),
            80,
            TransportKind::Ipv4,
            TransportAddr::ipv4(Ipv4Addr::new(127, 0, 0, 1), 8080),
        );
        t.upsert(
            ip("10.0.10.50"),
            80,
            TransportKind::Unix,
            TransportAddr::unix("/run/peer-80.sock"),
        );

        let buckets = t.get_client(ip("10.0.10.50"), 80).unwrap();
        // UNIX outranks IPv4 in iteration order
        assert_eq!(buckets[0].len(), 1);
        assert_eq!(buckets[0][0].transport, TransportKind::Unix);
        assert_eq!(buckets[3][0].transport, TransportKind::Ipv4);
    }
}
