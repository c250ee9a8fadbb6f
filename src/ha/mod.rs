//! High-availability layer
//!
//! Managed nodes grouped by role, a heartbeat scheduler, topology discovery
//! and the sentinel-driven manager tying them together.

pub mod cardio;
pub mod endpoint;
pub mod group;
pub mod manager;
pub mod ms_group;
pub mod node;
pub mod notification;
pub mod resolver;
pub mod role;
pub mod sentinel_group;

#[cfg(test)]
pub(crate) mod mock;

pub use cardio::{Cardio, Probe};
pub use endpoint::{Endpoint, Role};
pub use group::NodesGroup;
pub use manager::{NodeSelector, SentinelManager, TopologySnapshot};
pub use ms_group::MSGroup;
pub use node::{ManagedNode, NodeInfo, NodeState, Seed};
pub use notification::{DownEvent, InstanceType, SentinelEvent};
pub use resolver::{ResolvedTopology, TopologyResolver};
pub use sentinel_group::SentinelGroup;
