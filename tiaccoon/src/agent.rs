//! Agent wiring.
//!
//! Builds the shared tables, runs the bootstrap producer, and owns the
//! supervisor lifecycle.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tiaccoon_shared::TiaccoonResult;

use crate::destination::DestinationTable;
use crate::manage;
use crate::policy::AccessControl;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control socket the container runtime connects to.
    pub socket_path: PathBuf,
    /// Access-control verdict when no entry matches.
    pub default_policy: bool,
    /// This agent's own virtual IP.
    pub my_vip: IpAddr,
    /// Enable the RDMA signalling paths.
    pub feature_rdma: bool,
}

pub struct Agent {
    access: AccessControl,
    dest: Arc<DestinationTable>,
    supervisor: Arc<Supervisor>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let access = AccessControl::new(config.default_policy);
        let dest = Arc::new(DestinationTable::new(config.my_vip, config.feature_rdma));
        manage::bootstrap(&access, &dest, config.my_vip);

        let supervisor = Arc::new(Supervisor::new(
            access.clone(),
            dest.clone(),
            config.socket_path,
            config.my_vip,
            config.feature_rdma,
        ));

        Agent {
            access,
            dest,
            supervisor,
        }
    }

    /// The access-control tables, for embedders that manage policy at
    /// runtime.
    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    /// The destination table, for embedders that manage routes at runtime.
    pub fn destinations(&self) -> &Arc<DestinationTable> {
        &self.dest
    }

    /// Serve the control socket until [`Agent::shutdown`].
    pub async fn run(&self) -> TiaccoonResult<()> {
        tracing::info!("starting tiaccoon");
        self.supervisor.start().await
    }

    pub fn shutdown(&self) {
        self.supervisor.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    #[test]
    fn test_new_agent_has_bootstrap_tables() {
        let tmp = TempDir::new().unwrap();
        let agent = Agent::new(AgentConfig {
            socket_path: tmp.path().join("tiaccoon.sock"),
            default_policy: false,
            my_vip: IpAddr::V4(Ipv4Addr::new(10, 0, 10, 40)),
            feature_rdma: false,
        });
        assert!(agent
            .access()
            .client
            .apply(IpAddr::V4(Ipv4Addr::new(10, 0, 10, 50))));
        assert!(agent.destinations().get_server(80).is_some());
    }
}
