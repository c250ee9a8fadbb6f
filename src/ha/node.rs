//! A server the manager routes to, wrapping the pool or listener that
//! reaches it

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::cardio::Probe;
use super::endpoint::{Endpoint, Role};
use crate::client::{Listener, Pool, PoolFlags};
use crate::error::{Error, Result};

/// The resource a node owns: a connection pool for masters and slaves, a
/// pub/sub listener for sentinels
#[derive(Clone)]
pub enum Seed {
    Pool(Arc<dyn Pool>),
    Listener(Arc<dyn Listener>),
}

impl Seed {
    pub fn kind(&self) -> &'static str {
        match self {
            Seed::Pool(_) => "pool",
            Seed::Listener(_) => "listener",
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Seed::Pool(p) => p.endpoint(),
            Seed::Listener(l) => l.endpoint(),
        }
    }

    pub fn flags(&self) -> &PoolFlags {
        match self {
            Seed::Pool(p) => p.flags(),
            Seed::Listener(l) => l.flags(),
        }
    }

    pub async fn ping(&self) -> bool {
        match self {
            Seed::Pool(p) => p.ping().await,
            Seed::Listener(l) => l.ping().await,
        }
    }

    pub fn dispose(&self) {
        match self {
            Seed::Pool(p) => p.dispose(),
            Seed::Listener(l) => l.dispose(),
        }
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.endpoint())
    }
}

/// Node metadata handed to caller-supplied selectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub endpoint: Endpoint,
    pub role: Role,
    pub closed: bool,
    pub half_closed: bool,
}

/// Node status. `Disposed` is terminal; `Closed` outranks `HalfClosed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Open = 0,
    HalfClosed = 1,
    Closed = 2,
    Disposed = 3,
}

impl NodeState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::HalfClosed,
            2 => Self::Closed,
            3 => Self::Disposed,
            _ => Self::Open,
        }
    }

    /// State after marking (or clearing) objectively down
    fn with_closed(self, closed: bool) -> Self {
        match (self, closed) {
            (Self::Disposed, _) => Self::Disposed,
            (_, true) => Self::Closed,
            (Self::Closed, false) => Self::Open,
            (state, false) => state,
        }
    }

    /// State after marking (or clearing) subjectively down
    fn with_half_closed(self, half_closed: bool) -> Self {
        match (self, half_closed) {
            (Self::Open, true) => Self::HalfClosed,
            (Self::HalfClosed, false) => Self::Open,
            (state, _) => state,
        }
    }
}

/// Managed server node
pub struct ManagedNode {
    role: AtomicU8,
    endpoint: RwLock<Endpoint>,
    seed: RwLock<Seed>,
    state: AtomicU8,
    owns_seed: AtomicBool,
}

impl ManagedNode {
    pub fn new(role: Role, seed: Seed) -> Self {
        Self {
            role: AtomicU8::new(role as u8),
            endpoint: RwLock::new(seed.endpoint().clone()),
            seed: RwLock::new(seed),
            state: AtomicU8::new(NodeState::Open as u8),
            owns_seed: AtomicBool::new(true),
        }
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn set_role(&self, role: Role) {
        self.role.store(role as u8, Ordering::Release);
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.read().clone()
    }

    pub fn seed(&self) -> Seed {
        self.seed.read().clone()
    }

    pub fn pool(&self) -> Option<Arc<dyn Pool>> {
        match &*self.seed.read() {
            Seed::Pool(p) => Some(p.clone()),
            Seed::Listener(_) => None,
        }
    }

    pub fn listener(&self) -> Option<Arc<dyn Listener>> {
        match &*self.seed.read() {
            Seed::Listener(l) => Some(l.clone()),
            Seed::Pool(_) => None,
        }
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Apply `transition` atomically; returns the previous state
    fn transition(&self, transition: impl Fn(NodeState) -> NodeState) -> NodeState {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(transition(NodeState::from_u8(v)) as u8)
            })
            .unwrap_or_else(|v| v);
        NodeState::from_u8(previous)
    }

    /// Explicitly closed, disposed, or the seed reports itself down
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), NodeState::Closed | NodeState::Disposed)
            || self.seed.read().flags().is_down()
    }

    /// Marks objectively down; also pushed into the seed
    pub fn set_closed(&self, closed: bool) {
        self.transition(|state| state.with_closed(closed));
        self.seed.read().flags().set_odown(closed);
    }

    pub fn is_half_closed(&self) -> bool {
        self.state() == NodeState::HalfClosed || self.seed.read().flags().is_sdown()
    }

    /// Marks subjectively down; also pushed into the seed
    pub fn set_half_closed(&self, half_closed: bool) {
        self.transition(|state| state.with_half_closed(half_closed));
        self.seed.read().flags().set_sdown(half_closed);
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == NodeState::Disposed
    }

    /// Whether `dispose` also disposes the seed
    pub fn set_owns_seed(&self, owns: bool) {
        self.owns_seed.store(owns, Ordering::Release);
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            endpoint: self.endpoint(),
            role: self.role(),
            closed: self.is_closed(),
            half_closed: self.is_half_closed(),
        }
    }

    /// Liveness check through the seed. Never fails.
    pub async fn ping(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        let seed = self.seed();
        seed.ping().await
    }

    /// Swap in `seed` and return the previous one. The new seed must be the
    /// same kind (pool or listener) as the current one.
    pub fn exchange_seed(&self, seed: Seed) -> Result<Seed> {
        if self.is_disposed() {
            return Err(Error::Disposed("node"));
        }
        let mut current = self.seed.write();
        if current.kind() != seed.kind() {
            return Err(Error::SeedMismatch {
                expected: current.kind(),
                actual: seed.kind(),
            });
        }
        *self.endpoint.write() = seed.endpoint().clone();
        Ok(std::mem::replace(&mut *current, seed))
    }

    /// Dispose once; the seed is disposed only if this node owns it
    pub fn dispose(&self) {
        if self.transition(|_| NodeState::Disposed) == NodeState::Disposed {
            return;
        }
        if self.owns_seed.load(Ordering::Acquire) {
            self.seed.read().dispose();
        }
    }
}

impl fmt::Debug for ManagedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedNode")
            .field("endpoint", &self.endpoint())
            .field("role", &self.role())
            .field("closed", &self.is_closed())
            .field("half_closed", &self.is_half_closed())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[async_trait]
impl Probe for ManagedNode {
    async fn pulse(&self) -> bool {
        self.ping().await
    }

    fn name(&self) -> String {
        format!("{} {}", self.role(), self.endpoint())
    }
}
