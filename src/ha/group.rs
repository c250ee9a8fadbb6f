//! Round-robin group of nodes sharing a role

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use super::cardio::{Cardio, HealthCallback, Probe};
use super::endpoint::{Endpoint, Role};
use super::node::ManagedNode;

/// Health-change callback for nodes of a group
pub type PulseStateHandler = Arc<dyn Fn(&Arc<ManagedNode>, bool) + Send + Sync>;

/// Heartbeat registration shared by every node of a group
#[derive(Clone)]
pub struct Heartbeat {
    pub cardio: Arc<Cardio>,
    pub interval_secs: u64,
}

struct GroupState {
    nodes: Vec<Arc<ManagedNode>>,
    /// Index of the last node handed out, -1 when empty
    cursor: isize,
}

pub struct NodesGroup {
    role: Role,
    state: Mutex<GroupState>,
    disposed: AtomicBool,
    pulse_handler: Arc<RwLock<Option<PulseStateHandler>>>,
    heartbeat: Option<Heartbeat>,
}

impl NodesGroup {
    pub fn new(role: Role, nodes: Vec<Arc<ManagedNode>>, heartbeat: Option<Heartbeat>) -> Self {
        let group = Self {
            role,
            state: Mutex::new(GroupState {
                nodes: Vec::new(),
                cursor: -1,
            }),
            disposed: AtomicBool::new(false),
            pulse_handler: Arc::new(RwLock::new(None)),
            heartbeat,
        };
        for node in nodes {
            group.append_node(node);
        }
        group
    }

    pub fn empty(role: Role) -> Self {
        Self::new(role, Vec::new(), None)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().nodes.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Next node in round-robin order, `None` when empty or disposed
    pub fn next(&self) -> Option<Arc<ManagedNode>> {
        if self.is_disposed() {
            return None;
        }
        let mut state = self.state.lock();
        let len = state.nodes.len() as isize;
        if len == 0 {
            return None;
        }
        state.cursor = (state.cursor + 1).rem_euclid(len);
        Some(state.nodes[state.cursor as usize].clone())
    }

    /// Like `next`, skipping closed nodes
    pub fn next_available(&self) -> Option<Arc<ManagedNode>> {
        if self.is_disposed() {
            return None;
        }
        let mut state = self.state.lock();
        let len = state.nodes.len() as isize;
        for _ in 0..len {
            state.cursor = (state.cursor + 1).rem_euclid(len);
            let node = &state.nodes[state.cursor as usize];
            if !node.is_closed() {
                return Some(node.clone());
            }
        }
        None
    }

    /// Snapshot of the current nodes
    pub fn nodes(&self) -> Vec<Arc<ManagedNode>> {
        self.state.lock().nodes.clone()
    }

    pub fn find(&self, endpoint: &Endpoint) -> Option<Arc<ManagedNode>> {
        self.state
            .lock()
            .nodes
            .iter()
            .find(|n| n.endpoint() == *endpoint)
            .cloned()
    }

    pub fn contains(&self, node: &Arc<ManagedNode>) -> bool {
        self.state.lock().nodes.iter().any(|n| Arc::ptr_eq(n, node))
    }

    /// Returns false if the group is disposed or already holds `node`
    pub fn append_node(&self, node: Arc<ManagedNode>) -> bool {
        if self.is_disposed() {
            return false;
        }
        {
            let mut state = self.state.lock();
            if state.nodes.iter().any(|n| Arc::ptr_eq(n, &node)) {
                return false;
            }
            state.nodes.push(node.clone());
        }
        self.attach(&node);
        true
    }

    /// Returns false if `node` is not in the group
    pub fn remove_node(&self, node: &Arc<ManagedNode>) -> bool {
        {
            let mut state = self.state.lock();
            let Some(index) = state.nodes.iter().position(|n| Arc::ptr_eq(n, node)) else {
                return false;
            };
            state.nodes.remove(index);
            let len = state.nodes.len() as isize;
            if len == 0 {
                state.cursor = -1;
            } else if state.cursor >= len {
                state.cursor = len - 1;
            }
        }
        self.detach(node);
        true
    }

    /// Replace every node and return the previous ones. The previous nodes
    /// are detached from the heartbeat but not disposed.
    pub fn exchange_nodes(&self, nodes: Vec<Arc<ManagedNode>>) -> Vec<Arc<ManagedNode>> {
        let previous = {
            let mut state = self.state.lock();
            state.cursor = -1;
            std::mem::replace(&mut state.nodes, nodes.clone())
        };
        for node in &previous {
            self.detach(node);
        }
        for node in &nodes {
            self.attach(node);
        }
        previous
    }

    pub fn set_pulse_handler(&self, handler: Option<PulseStateHandler>) {
        *self.pulse_handler.write() = handler;
    }

    pub fn take_pulse_handler(&self) -> Option<PulseStateHandler> {
        self.pulse_handler.write().take()
    }

    /// Detach every node from the heartbeat without disposing anything
    pub fn release(&self) {
        for node in self.nodes() {
            self.detach(&node);
        }
    }

    /// Dispose every node once; later calls are no-ops
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let nodes = {
            let mut state = self.state.lock();
            state.cursor = -1;
            std::mem::take(&mut state.nodes)
        };
        self.pulse_handler.write().take();
        for node in nodes {
            self.detach(&node);
            node.dispose();
        }
    }

    fn attach(&self, node: &Arc<ManagedNode>) {
        let Some(heartbeat) = &self.heartbeat else {
            return;
        };
        let weak = Arc::downgrade(node);
        let handler = self.pulse_handler.clone();
        let on_change: HealthCallback = Arc::new(move |healthy: bool| {
            let Some(node) = weak.upgrade() else {
                return;
            };
            node.set_half_closed(!healthy);
            let handler = handler.read().clone();
            if let Some(handler) = handler {
                handler(&node, healthy);
            }
        });
        let probe: Arc<dyn Probe> = node.clone();
        heartbeat
            .cardio
            .attach(probe, heartbeat.interval_secs, on_change);
    }

    fn detach(&self, node: &Arc<ManagedNode>) {
        if let Some(heartbeat) = &self.heartbeat {
            let probe: Arc<dyn Probe> = node.clone();
            heartbeat.cardio.detach(&probe);
        }
    }
}

impl Drop for NodesGroup {
    fn drop(&mut self) {
        self.release();
    }
}
