//! Bootstrap table producer.
//!
//! Seeds the destination and access-control tables at startup. The two
//! wildcard entries let zero binds resolve; the remaining entries wire the
//! demo pair of nodes (each agent allows its peer and maps the peer's web
//! port onto the local reverse-proxy port).

use std::net::{IpAddr, Ipv4Addr};

use crate::destination::{DestinationTable, TransportAddr, TransportKind};
use crate::policy::AccessControl;
use crate::vip;

const NODE_A_VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 10, 40);
const NODE_B_VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 10, 50);

/// The other node of the demo pair.
fn peer_vip(my_vip: IpAddr) -> IpAddr {
    if vip::ip_eq(&my_vip, &IpAddr::V4(NODE_A_VIP)) {
        IpAddr::V4(NODE_B_VIP)
    } else {
        IpAddr::V4(NODE_A_VIP)
    }
}

/// Populate the tables the engine reads. Runs before the supervisor starts
/// accepting containers.
pub fn bootstrap(access: &AccessControl, dest: &DestinationTable, my_vip: IpAddr) {
    let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    // wildcard bind targets so a zero bind can resolve
    dest.upsert(
        unspecified,
        0,
        TransportKind::Ipv4,
        TransportAddr::ipv4(Ipv4Addr::UNSPECIFIED, 0),
    );
    dest.upsert(
        my_vip,
        0,
        TransportKind::Ipv4,
        TransportAddr::ipv4(Ipv4Addr::UNSPECIFIED, 0),
    );

    let peer = peer_vip(my_vip);
    access.upsert_client(peer, true);

    // web route: the peer's port 80 is served locally on 8080
    dest.upsert(
        peer,
        80,
        TransportKind::Ipv4,
        TransportAddr::ipv4(Ipv4Addr::LOCALHOST, 8080),
    );
    dest.upsert(
        my_vip,
        80,
        TransportKind::Ipv4,
        TransportAddr::ipv4(Ipv4Addr::UNSPECIFIED, 8080),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_vip_flips_between_nodes() {
        assert_eq!(peer_vip(IpAddr::V4(NODE_A_VIP)), IpAddr::V4(NODE_B_VIP));
        assert_eq!(peer_vip(IpAddr::V4(NODE_B_VIP)), IpAddr::V4(NODE_A_VIP));
        assert_eq!(
            peer_vip(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))),
            IpAddr::V4(NODE_A_VIP)
        );
    }

    #[test]
    fn test_bootstrap_seeds_routes() {
        let my_vip = IpAddr::V4(NODE_A_VIP);
        let access = AccessControl::new(false);
        let dest = DestinationTable::new(my_vip, false);
        bootstrap(&access, &dest, my_vip);

        // the peer may be dialled
        assert!(access.client.apply(IpAddr::V4(NODE_B_VIP)));
        assert!(!access.server.apply(IpAddr::V4(NODE_B_VIP)));

        // client route to the peer's web port
        let buckets = dest.get_client(IpAddr::V4(NODE_B_VIP), 80).unwrap();
        assert_eq!(
            buckets[TransportKind::Ipv4.index()][0].address,
            TransportAddr::ipv4(Ipv4Addr::LOCALHOST, 8080)
        );

        // server side of the same port plus the wildcard bind entries
        assert!(dest.get_server(80).is_some());
        assert!(dest.get_server(0).is_some());
    }
}
