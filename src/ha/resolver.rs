//! Topology discovery
//!
//! Depth-first walk from the seed endpoints. Each server is asked for its
//! role and peers; peers are visited in turn. Endpoints are marked visited
//! before their peers are expanded, so cyclic references terminate.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::endpoint::{Endpoint, Role};
use super::role::{RoleInfo, discover_role};
use crate::client::{Connection, Transport};
use crate::error::Result;

/// A server found during discovery, with the connection used to query it
pub struct DiscoveredNode {
    pub role: Role,
    pub endpoint: Endpoint,
    pub connection: Box<dyn Connection>,
}

impl fmt::Debug for DiscoveredNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.role, self.endpoint)
    }
}

#[derive(Debug, Default)]
pub struct ResolvedTopology {
    pub masters: Vec<DiscoveredNode>,
    pub slaves: Vec<DiscoveredNode>,
    pub sentinels: Vec<DiscoveredNode>,
}

impl ResolvedTopology {
    pub fn is_empty(&self) -> bool {
        self.masters.is_empty() && self.slaves.is_empty() && self.sentinels.is_empty()
    }

    fn push(&mut self, node: DiscoveredNode) {
        match node.role {
            Role::Master => self.masters.push(node),
            Role::Slave => self.slaves.push(node),
            Role::Sentinel => self.sentinels.push(node),
            _ => {}
        }
    }

    fn describe(nodes: &[DiscoveredNode]) -> String {
        nodes
            .iter()
            .map(|n| n.endpoint.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for ResolvedTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "masters=[{}] slaves=[{}] sentinels=[{}]",
            Self::describe(&self.masters),
            Self::describe(&self.slaves),
            Self::describe(&self.sentinels)
        )
    }
}

pub struct TopologyResolver {
    transport: Arc<dyn Transport>,
    master_name: Option<String>,
}

impl TopologyResolver {
    pub fn new(transport: Arc<dyn Transport>, master_name: Option<String>) -> Self {
        Self {
            transport,
            master_name,
        }
    }

    /// Discover everything reachable from `seeds`. Servers that cannot be
    /// reached or that answer with something unusable are left out.
    pub async fn resolve(&self, seeds: &[Endpoint]) -> ResolvedTopology {
        let mut visited: HashSet<Endpoint> = HashSet::new();
        let mut stack: Vec<Endpoint> = seeds.iter().rev().cloned().collect();
        let mut topology = ResolvedTopology::default();

        while let Some(endpoint) = stack.pop() {
            if endpoint.is_empty() || !visited.insert(endpoint.clone()) {
                continue;
            }

            let (info, connection) = match self.discover(&endpoint).await {
                Ok(found) => found,
                Err(e) => {
                    log::debug!("Skipping {} during discovery: {}", endpoint, e);
                    continue;
                }
            };

            let role = info.role();
            if role == Role::Undefined {
                log::debug!("Skipping {}: role unknown", endpoint);
                continue;
            }
            log::debug!("Discovered {} {}", role, endpoint);

            for sibling in info.siblings().into_iter().rev() {
                if !visited.contains(&sibling) {
                    stack.push(sibling);
                }
            }

            topology.push(DiscoveredNode {
                role,
                endpoint,
                connection,
            });
        }

        topology
    }

    async fn discover(&self, endpoint: &Endpoint) -> Result<(RoleInfo, Box<dyn Connection>)> {
        let mut conn = self.transport.connect(endpoint).await?;
        let info = discover_role(conn.as_mut(), self.master_name.as_deref()).await?;
        Ok((info, conn))
    }
}
