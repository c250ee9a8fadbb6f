//! Master / slave group pair

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::endpoint::Role;
use super::group::NodesGroup;
use super::node::ManagedNode;

pub struct MSGroup {
    masters: RwLock<Arc<NodesGroup>>,
    slaves: RwLock<Arc<NodesGroup>>,
    /// Serializes moves between the two groups
    lock: Mutex<()>,
}

impl MSGroup {
    pub fn new(masters: Arc<NodesGroup>, slaves: Arc<NodesGroup>) -> Self {
        Self {
            masters: RwLock::new(masters),
            slaves: RwLock::new(slaves),
            lock: Mutex::new(()),
        }
    }

    pub fn masters(&self) -> Arc<NodesGroup> {
        self.masters.read().clone()
    }

    pub fn slaves(&self) -> Arc<NodesGroup> {
        self.slaves.read().clone()
    }

    pub fn group(&self, role: Role) -> Option<Arc<NodesGroup>> {
        match role {
            Role::Master => Some(self.masters()),
            Role::Slave => Some(self.slaves()),
            _ => None,
        }
    }

    /// Install a new masters group; the pulse handler moves over and the
    /// displaced group is returned for the caller to dispose
    pub fn exchange_masters(&self, group: Arc<NodesGroup>) -> Arc<NodesGroup> {
        let _guard = self.lock.lock();
        Self::exchange(&self.masters, group)
    }

    /// Install a new slaves group; see `exchange_masters`
    pub fn exchange_slaves(&self, group: Arc<NodesGroup>) -> Arc<NodesGroup> {
        let _guard = self.lock.lock();
        Self::exchange(&self.slaves, group)
    }

    fn exchange(slot: &RwLock<Arc<NodesGroup>>, group: Arc<NodesGroup>) -> Arc<NodesGroup> {
        let mut current = slot.write();
        if let Some(handler) = current.take_pulse_handler() {
            group.set_pulse_handler(Some(handler));
        }
        std::mem::replace(&mut *current, group)
    }

    /// Move `node` to the other group: slave to master or master to slave.
    /// Returns false when the node is in neither group.
    pub fn change_group(&self, node: &Arc<ManagedNode>) -> bool {
        let _guard = self.lock.lock();
        let masters = self.masters();
        let slaves = self.slaves();

        if slaves.remove_node(node) {
            node.set_role(Role::Master);
            masters.append_node(node.clone());
            log::info!("{} moved to masters", node.endpoint());
            true
        } else if masters.remove_node(node) {
            node.set_role(Role::Slave);
            slaves.append_node(node.clone());
            log::info!("{} moved to slaves", node.endpoint());
            true
        } else {
            false
        }
    }

    pub fn dispose(&self) {
        self.masters().dispose();
        self.slaves().dispose();
    }
}
