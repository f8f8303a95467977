//! Access-control tables.
//!
//! Policy is a per-IP boolean with a table-wide default. The agent keeps two
//! tables: the client table, consulted with the destination IP on `connect`,
//! and the server table, consulted with the source IP when a host accept
//! task takes in a connection.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use tiaccoon_shared::{TiaccoonError, TiaccoonResult};

use crate::vip;

/// A `(VIP → allow/deny)` table with a default policy.
///
/// Reads happen concurrently from every notification worker and accept
/// task; writes come from the table producer.
#[derive(Debug)]
pub struct PolicyTable {
    default_policy: bool,
    entries: RwLock<HashMap<u64, HashMap<u64, bool>>>,
}

impl PolicyTable {
    pub fn new(default_policy: bool) -> Self {
        PolicyTable {
            default_policy,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn upsert(&self, ip: IpAddr, policy: bool) {
        let (upper, lower) = vip::ip_key(&ip);
        tracing::debug!(%ip, upper, lower, policy, "upserting access control entry");
        self.entries
            .write()
            .entry(upper)
            .or_default()
            .insert(lower, policy);
    }

    pub fn remove(&self, ip: IpAddr) {
        let (upper, lower) = vip::ip_key(&ip);
        tracing::debug!(%ip, upper, lower, "removing access control entry");
        if let Some(inner) = self.entries.write().get_mut(&upper) {
            inner.remove(&lower);
        }
    }

    /// Resolve the policy for `ip`: the specific entry if present, the
    /// default otherwise.
    pub fn apply(&self, ip: IpAddr) -> bool {
        let (upper, lower) = vip::ip_key(&ip);
        if let Some(inner) = self.entries.read().get(&upper) {
            if let Some(policy) = inner.get(&lower) {
                return *policy;
            }
        }
        self.default_policy
    }

    /// [`PolicyTable::apply`] as a fallible operation: a denial surfaces as
    /// [`TiaccoonError::PolicyDenied`], which callers map onto the syscall
    /// response (`-EACCES`) or the control-channel reply.
    pub fn check(&self, ip: IpAddr) -> TiaccoonResult<()> {
        if self.apply(ip) {
            Ok(())
        } else {
            Err(TiaccoonError::PolicyDenied)
        }
    }
}

/// The pair of access-control tables an agent runs with.
#[derive(Debug, Clone)]
pub struct AccessControl {
    /// Consulted with the source IP of incoming connections.
    pub server: Arc<PolicyTable>,
    /// Consulted with the destination IP of outgoing connections.
    pub client: Arc<PolicyTable>,
}

impl AccessControl {
    pub fn new(default_policy: bool) -> Self {
        AccessControl {
            server: Arc::new(PolicyTable::new(default_policy)),
            client: Arc::new(PolicyTable::new(default_policy)),
        }
    }

    pub fn upsert_client(&self, dst_ip: IpAddr, policy: bool) {
        self.client.upsert(dst_ip, policy);
        tracing::info!(%dst_ip, policy, "client access control upserted");
    }

    pub fn remove_client(&self, dst_ip: IpAddr) {
        self.client.remove(dst_ip);
        tracing::info!(%dst_ip, "client access control removed");
    }

    pub fn upsert_server(&self, src_ip: IpAddr, policy: bool) {
        self.server.upsert(src_ip, policy);
        tracing::info!(%src_ip, policy, "server access control upserted");
    }

    pub fn remove_server(&self, src_ip: IpAddr) {
        self.server.remove(src_ip);
        tracing::info!(%src_ip, "server access control removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_policy_when_absent() {
        let allow = PolicyTable::new(true);
        let deny = PolicyTable::new(false);
        assert!(allow.apply(ip("10.0.10.50")));
        assert!(!deny.apply(ip("10.0.10.50")));
    }

    #[test]
    fn test_upsert_apply_remove() {
        let table = PolicyTable::new(false);
        table.upsert(ip("10.0.10.50"), true);
        assert!(table.apply(ip("10.0.10.50")));
        table.upsert(ip("10.0.10.50"), false);
        assert!(!table.apply(ip("10.0.10.50")));
        table.remove(ip("10.0.10.50"));
        assert!(!table.apply(ip("10.0.10.50")));
    }

    #[test]
    fn test_ipv4_and_mapped_form_share_entry() {
        let table = PolicyTable::new(false);
        table.upsert(ip("10.0.10.50"), true);
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 10, 50).to_ipv6_mapped());
        assert!(table.apply(mapped));

        table.remove(mapped);
        assert!(!table.apply(ip("10.0.10.50")));
    }

    #[test]
    fn test_check_surfaces_policy_denied() {
        let table = PolicyTable::new(false);
        table.upsert(ip("10.0.10.50"), true);
        assert!(table.check(ip("10.0.10.50")).is_ok());
        assert!(matches!(
            table.check(ip("10.0.10.60")),
            Err(TiaccoonError::PolicyDenied)
        ));
    }

    #[test]
    fn test_client_and_server_tables_are_independent() {
        let ac = AccessControl::new(false);
        ac.upsert_client(ip("10.0.10.50"), true);
        assert!(ac.client.apply(ip("10.0.10.50")));
        assert!(!ac.server.apply(ip("10.0.10.50")));
    }
}
