//! Sentinel-aware connection manager
//!
//! Discovers the deployment on first use, routes requests to masters or
//! slaves, follows sentinel events, and reconciles the routing tables on
//! refresh without throwing away pools that are still valid.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::cardio::Cardio;
use super::endpoint::{Endpoint, Role};
use super::group::{Heartbeat, NodesGroup, PulseStateHandler};
use super::ms_group::MSGroup;
use super::node::{ManagedNode, NodeInfo, Seed};
use super::notification::{DownEvent, InstanceType, SentinelEvent};
use super::resolver::{DiscoveredNode, TopologyResolver};
use super::sentinel_group::{SentinelGroup, SentinelObserver};
use crate::client::{
    Db, Listener, MonitorChannel, Pipeline, TcpTransport, Transaction, Transport,
};
use crate::config::{CardioSettings, HaSettings};
use crate::error::{Error, Result};

/// Caller-supplied node predicate
pub type NodeSelector<'a> = dyn Fn(&NodeInfo) -> bool + Send + Sync + 'a;

/// Called after every sentinel event has been applied
pub type EventHook = Arc<dyn Fn(&SentinelEvent) + Send + Sync>;

// Initialization states
const STATE_UNDEFINED: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_INITIALIZED: u8 = 2;

#[derive(Clone)]
struct Topology {
    ms: Arc<MSGroup>,
    sentinels: Arc<SentinelGroup>,
}

/// Point-in-time view of the routing tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub masters: Vec<NodeInfo>,
    pub slaves: Vec<NodeInfo>,
    pub sentinels: Vec<NodeInfo>,
    /// Sentinels with an active notification subscription
    pub monitored: Vec<Endpoint>,
}

impl TopologySnapshot {
    fn write_nodes(f: &mut fmt::Formatter<'_>, title: &str, nodes: &[NodeInfo]) -> fmt::Result {
        writeln!(f, "{} ({}):", title, nodes.len())?;
        for node in nodes {
            let status = if node.closed {
                "down"
            } else if node.half_closed {
                "sdown"
            } else {
                "ok"
            };
            writeln!(f, "  {} {}", node.endpoint, status)?;
        }
        Ok(())
    }
}

impl fmt::Display for TopologySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Self::write_nodes(f, "masters", &self.masters)?;
        Self::write_nodes(f, "slaves", &self.slaves)?;
        Self::write_nodes(f, "sentinels", &self.sentinels)?;
        write!(f, "monitoring {} sentinel(s)", self.monitored.len())
    }
}

/// Entry point for applications. Dropping it disposes every node.
pub struct SentinelManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    settings: HaSettings,
    transport: Arc<dyn Transport>,
    heartbeat: Option<Heartbeat>,
    resolver: TopologyResolver,
    init_state: AtomicU8,
    init_lock: tokio::sync::Mutex<()>,
    refreshing: AtomicBool,
    topology: RwLock<Option<Topology>>,
    /// Held only around group selection
    select_lock: Mutex<()>,
    event_hook: RwLock<Option<EventHook>>,
    disposed: AtomicBool,
    this: Weak<ManagerInner>,
}

impl SentinelManager {
    /// Manager over TCP with its own heartbeat scheduler
    pub fn new(settings: HaSettings) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(&settings));
        let cardio = Arc::new(Cardio::new(CardioSettings::default()));
        Self::with_transport(settings, transport, Some(cardio))
    }

    /// Manager over a caller-supplied transport and (optionally shared)
    /// heartbeat scheduler
    pub fn with_transport(
        settings: HaSettings,
        transport: Arc<dyn Transport>,
        cardio: Option<Arc<Cardio>>,
    ) -> Self {
        let heartbeat = cardio
            .filter(|_| settings.heartbeat_enabled)
            .map(|cardio| Heartbeat {
                cardio,
                interval_secs: settings.heartbeat_interval_secs,
            });
        let resolver = TopologyResolver::new(transport.clone(), settings.master_name.clone());

        let inner = Arc::new_cyclic(|this| ManagerInner {
            settings,
            transport,
            heartbeat,
            resolver,
            init_state: AtomicU8::new(STATE_UNDEFINED),
            init_lock: tokio::sync::Mutex::new(()),
            refreshing: AtomicBool::new(false),
            topology: RwLock::new(None),
            select_lock: Mutex::new(()),
            event_hook: RwLock::new(None),
            disposed: AtomicBool::new(false),
            this: this.clone(),
        });
        Self { inner }
    }

    pub fn settings(&self) -> &HaSettings {
        &self.inner.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.init_state.load(Ordering::Acquire) == STATE_INITIALIZED
    }

    /// Discover the topology now instead of on first use
    pub async fn initialize(&self) -> Result<()> {
        self.inner.initialize_nodes().await
    }

    /// Re-discover and reconcile. Returns false when a refresh was already
    /// running.
    pub async fn refresh(&self) -> Result<bool> {
        self.inner.refresh().await
    }

    /// Connection to the next master, or to the next slave when `read_only`
    /// (falling back to masters when no slave is usable)
    pub async fn get_db(&self, read_only: bool, db: Option<usize>) -> Result<Db> {
        self.inner.initialize_nodes().await?;
        let node = self.inner.select(read_only)?;
        self.inner.open_db(&node, db).await
    }

    /// Connection to the first usable master or slave accepted by `selector`
    pub async fn get_db_with(&self, selector: &NodeSelector<'_>, db: Option<usize>) -> Result<Db> {
        self.inner.initialize_nodes().await?;
        let node = self.inner.select_with(selector, false)?;
        self.inner.open_db(&node, db).await
    }

    pub async fn begin_transaction(&self, db: Option<usize>) -> Result<Transaction> {
        Ok(Transaction::new(self.get_db(false, db).await?))
    }

    pub async fn begin_transaction_with(
        &self,
        selector: &NodeSelector<'_>,
        db: Option<usize>,
    ) -> Result<Transaction> {
        Ok(Transaction::new(self.get_db_with(selector, db).await?))
    }

    pub async fn create_pipeline(&self, read_only: bool, db: Option<usize>) -> Result<Pipeline> {
        Ok(Pipeline::new(self.get_db(read_only, db).await?))
    }

    pub async fn create_pipeline_with(
        &self,
        selector: &NodeSelector<'_>,
        db: Option<usize>,
    ) -> Result<Pipeline> {
        Ok(Pipeline::new(self.get_db_with(selector, db).await?))
    }

    /// Pub/sub channel on the next master, or on the node `selector`
    /// accepts (sentinels included)
    pub async fn get_pubsub_channel(
        &self,
        selector: Option<&NodeSelector<'_>>,
    ) -> Result<Arc<dyn Listener>> {
        self.inner.initialize_nodes().await?;
        let node = match selector {
            Some(selector) => self.inner.select_with(selector, true)?,
            None => self.inner.select(false)?,
        };
        Ok(match node.seed() {
            Seed::Pool(pool) => pool.pubsub_channel(),
            Seed::Listener(listener) => listener,
        })
    }

    /// MONITOR stream on the next master, or on the node `selector` accepts
    pub async fn get_monitor_channel(
        &self,
        selector: Option<&NodeSelector<'_>>,
    ) -> Result<Arc<dyn MonitorChannel>> {
        self.inner.initialize_nodes().await?;
        let node = match selector {
            Some(selector) => self.inner.select_with(selector, false)?,
            None => self.inner.select(false)?,
        };
        let pool = node
            .pool()
            .ok_or(Error::NoNodeAvailable { role: node.role() })?;
        Ok(pool.monitor_channel())
    }

    /// Register a callback run after each sentinel event is applied
    pub fn on_event(&self, hook: EventHook) {
        *self.inner.event_hook.write() = Some(hook);
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        self.inner.snapshot()
    }

    /// Stop monitoring and dispose every node. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl Drop for SentinelManager {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl ManagerInner {
    fn current(&self) -> Option<Topology> {
        self.topology.read().clone()
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("manager"));
        }
        Ok(())
    }

    async fn initialize_nodes(&self) -> Result<()> {
        self.check_disposed()?;
        if self.init_state.load(Ordering::Acquire) == STATE_INITIALIZED {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self
            .init_state
            .compare_exchange(
                STATE_UNDEFINED,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Initialized by the caller we waited on
            return Ok(());
        }

        // Dropped mid-discovery (caller timeout) leaves the state undefined
        let mut init = InitGuard {
            state: &self.init_state,
            done: false,
        };
        match self.refresh_all_nodes().await {
            Ok(()) => {
                init.done = true;
                Ok(())
            }
            Err(e) => {
                log::warn!("Topology initialization failed: {}", e);
                Err(e)
            }
        }
    }

    async fn refresh(&self) -> Result<bool> {
        self.check_disposed()?;
        if self.init_state.load(Ordering::Acquire) != STATE_INITIALIZED {
            self.initialize_nodes().await?;
            return Ok(true);
        }
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Refresh already in progress");
            return Ok(false);
        }
        let _guard = RefreshGuard(&self.refreshing);
        self.refresh_all_nodes().await.map(|_| true)
    }

    fn schedule_refresh(&self) {
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = inner.refresh().await {
                log::warn!("Background refresh failed: {}", e);
            }
        });
    }

    /// Configured seeds first, then every endpoint currently known
    fn seed_endpoints(&self) -> Vec<Endpoint> {
        let mut seeds = self.settings.seed_endpoints();
        if let Some(topology) = self.current() {
            let known = topology
                .sentinels
                .group()
                .nodes()
                .into_iter()
                .chain(topology.ms.masters().nodes())
                .chain(topology.ms.slaves().nodes());
            for node in known {
                let endpoint = node.endpoint();
                if !seeds.contains(&endpoint) {
                    seeds.push(endpoint);
                }
            }
        }
        seeds
    }

    async fn refresh_all_nodes(&self) -> Result<()> {
        let seeds = self.seed_endpoints();
        let resolved = self.resolver.resolve(&seeds).await;
        if resolved.is_empty() {
            let tried: Vec<String> = seeds.iter().map(|ep| ep.to_string()).collect();
            return Err(Error::NoTopology(format!(
                "no server answered among [{}]",
                tried.join(", ")
            )));
        }
        self.check_disposed()?;
        log::info!("Resolved topology: {}", resolved);

        let masters = self.build_data_nodes(Role::Master, resolved.masters);
        let slaves = self.build_data_nodes(Role::Slave, resolved.slaves);
        let sentinels = self.build_sentinel_nodes(resolved.sentinels);

        match self.current() {
            None => self.install(masters, slaves, sentinels).await,
            Some(current) => self.reconcile(current, masters, slaves, sentinels).await,
        }
    }

    fn build_data_nodes(&self, role: Role, found: Vec<DiscoveredNode>) -> Vec<Arc<ManagedNode>> {
        found
            .into_iter()
            .map(|n| {
                let pool = self.transport.create_pool(&n.endpoint, Some(n.connection));
                Arc::new(ManagedNode::new(role, Seed::Pool(pool)))
            })
            .collect()
    }

    fn build_sentinel_nodes(&self, found: Vec<DiscoveredNode>) -> Vec<Arc<ManagedNode>> {
        found
            .into_iter()
            .map(|n| {
                let listener = self.transport.create_listener(&n.endpoint);
                Arc::new(ManagedNode::new(Role::Sentinel, Seed::Listener(listener)))
            })
            .collect()
    }

    fn new_group(&self, role: Role, nodes: Vec<Arc<ManagedNode>>) -> Arc<NodesGroup> {
        Arc::new(NodesGroup::new(role, nodes, self.heartbeat.clone()))
    }

    /// Cold start: nothing to reconcile against
    async fn install(
        &self,
        masters: Vec<Arc<ManagedNode>>,
        slaves: Vec<Arc<ManagedNode>>,
        sentinels: Vec<Arc<ManagedNode>>,
    ) -> Result<()> {
        let masters = self.new_group(Role::Master, masters);
        let slaves = self.new_group(Role::Slave, slaves);
        let sentinels = self.new_group(Role::Sentinel, sentinels);
        masters.set_pulse_handler(Some(self.data_pulse_handler()));
        slaves.set_pulse_handler(Some(self.data_pulse_handler()));
        sentinels.set_pulse_handler(Some(self.sentinel_pulse_handler()));

        let topology = Topology {
            ms: Arc::new(MSGroup::new(masters, slaves)),
            sentinels: Arc::new(SentinelGroup::new(sentinels)),
        };
        {
            let mut slot = self.topology.write();
            if self.disposed.load(Ordering::Acquire) {
                drop(slot);
                topology.sentinels.dispose();
                topology.ms.dispose();
                return Err(Error::Disposed("manager"));
            }
            *slot = Some(topology.clone());
        }
        self.start_monitoring(&topology.sentinels).await;
        Ok(())
    }

    async fn reconcile(
        &self,
        current: Topology,
        masters: Vec<Arc<ManagedNode>>,
        slaves: Vec<Arc<ManagedNode>>,
        sentinels: Vec<Arc<ManagedNode>>,
    ) -> Result<()> {
        {
            // dispose() takes the slot under this lock; never swap groups
            // into a topology it already released
            let slot = self.topology.write();
            let released = slot
                .as_ref()
                .is_none_or(|installed| !Arc::ptr_eq(&installed.ms, &current.ms));
            if self.disposed.load(Ordering::Acquire) || released {
                drop(slot);
                for node in masters.iter().chain(&slaves).chain(&sentinels) {
                    node.dispose();
                }
                return Err(Error::Disposed("manager"));
            }

            let kept_masters = transplant(&current.ms.masters(), &masters);
            let kept_slaves = transplant(&current.ms.slaves(), &slaves);
            let kept_sentinels = transplant(&current.sentinels.group(), &sentinels);

            let old_masters = current
                .ms
                .exchange_masters(self.new_group(Role::Master, masters));
            let old_slaves = current
                .ms
                .exchange_slaves(self.new_group(Role::Slave, slaves));
            let old_sentinels = current
                .sentinels
                .exchange_group(self.new_group(Role::Sentinel, sentinels));

            retire(&old_masters, &kept_masters);
            retire(&old_slaves, &kept_slaves);
            retire(&old_sentinels, &kept_sentinels);
        }

        if current.sentinels.is_monitoring() {
            current.sentinels.resubscribe().await;
        } else {
            self.start_monitoring(&current.sentinels).await;
        }
        Ok(())
    }

    async fn start_monitoring(&self, sentinels: &SentinelGroup) {
        let observer: Weak<dyn SentinelObserver> = self.this.clone();
        let subscribed = sentinels.monitor(observer).await;
        if self.disposed.load(Ordering::Acquire) {
            sentinels.quit();
            return;
        }
        if subscribed == 0 && !sentinels.group().is_empty() {
            log::warn!("No sentinel could be subscribed to; failover events will be missed");
        }
    }

    fn data_pulse_handler(&self) -> PulseStateHandler {
        Arc::new(|node: &Arc<ManagedNode>, healthy: bool| {
            if healthy {
                log::info!("{} {} is reachable again", node.role(), node.endpoint());
            } else {
                log::warn!("{} {} stopped answering", node.role(), node.endpoint());
            }
        })
    }

    fn sentinel_pulse_handler(&self) -> PulseStateHandler {
        let this = self.this.clone();
        Arc::new(move |node: &Arc<ManagedNode>, healthy: bool| {
            if !healthy {
                log::warn!("Sentinel {} stopped answering", node.endpoint());
                return;
            }
            log::info!("Sentinel {} is reachable again", node.endpoint());
            if let Some(inner) = this.upgrade() {
                tokio::spawn(async move {
                    if let Some(topology) = inner.current() {
                        topology.sentinels.resubscribe().await;
                    }
                });
            }
        })
    }

    fn select(&self, read_only: bool) -> Result<Arc<ManagedNode>> {
        self.check_disposed()?;
        let _guard = self.select_lock.lock();
        let topology = self
            .current()
            .ok_or_else(|| Error::NoTopology("not initialized".to_string()))?;

        if read_only && let Some(node) = topology.ms.slaves().next_available() {
            return Ok(node);
        }
        topology.ms.masters().next_available().ok_or(Error::NoNodeAvailable {
            role: if read_only { Role::Any } else { Role::Master },
        })
    }

    fn select_with(
        &self,
        selector: &NodeSelector<'_>,
        include_sentinels: bool,
    ) -> Result<Arc<ManagedNode>> {
        self.check_disposed()?;
        let _guard = self.select_lock.lock();
        let topology = self
            .current()
            .ok_or_else(|| Error::NoTopology("not initialized".to_string()))?;

        let mut candidates = topology.ms.masters().nodes();
        candidates.extend(topology.ms.slaves().nodes());
        if include_sentinels {
            candidates.extend(topology.sentinels.group().nodes());
        }
        candidates
            .into_iter()
            .find(|node| !node.is_closed() && selector(&node.info()))
            .ok_or(Error::NoNodeAvailable { role: Role::Any })
    }

    async fn open_db(&self, node: &Arc<ManagedNode>, db: Option<usize>) -> Result<Db> {
        let pool = node
            .pool()
            .ok_or(Error::NoNodeAvailable { role: node.role() })?;
        let conn = pool.connect(db.unwrap_or(self.settings.default_db)).await?;
        Ok(Db::new(node.role(), conn))
    }

    fn on_master_switched(&self, topology: &Topology, old: &Endpoint, new: &Endpoint) {
        log::warn!("Master switched from {} to {}", old, new);

        if let Some(node) = topology.ms.masters().find(old) {
            node.set_half_closed(true);
            node.set_closed(true);
        }

        match topology.ms.slaves().find(new) {
            Some(slave) => {
                if topology.ms.change_group(&slave) {
                    slave.set_half_closed(false);
                    slave.set_closed(false);
                }
            }
            None if topology.ms.masters().find(new).is_none() => {
                log::info!("New master {} is unknown, refreshing topology", new);
                self.schedule_refresh();
            }
            None => {}
        }
    }

    fn on_instance_state_changed(
        &self,
        topology: &Topology,
        event: DownEvent,
        instance_type: InstanceType,
        endpoint: &Endpoint,
    ) {
        let group = match instance_type {
            InstanceType::Master => topology.ms.masters(),
            InstanceType::Slave => topology.ms.slaves(),
            InstanceType::Sentinel => return,
        };
        let Some(node) = group.find(endpoint) else {
            log::debug!(
                "Ignoring {} for unknown {} {}",
                event.channel_name(),
                group.role(),
                endpoint
            );
            return;
        };

        match event {
            DownEvent::SDownEnter | DownEvent::SDownExit => node.set_half_closed(event.is_down()),
            DownEvent::ODownEnter | DownEvent::ODownExit => node.set_closed(event.is_down()),
        }
        log::info!("{} {} {}", event.channel_name(), group.role(), endpoint);
    }

    fn snapshot(&self) -> TopologySnapshot {
        let Some(topology) = self.current() else {
            return TopologySnapshot::default();
        };
        let infos = |group: Arc<NodesGroup>| -> Vec<NodeInfo> {
            group.nodes().iter().map(|n| n.info()).collect()
        };
        TopologySnapshot {
            masters: infos(topology.ms.masters()),
            slaves: infos(topology.ms.slaves()),
            sentinels: infos(topology.sentinels.group()),
            monitored: topology.sentinels.monitored(),
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let topology = self.topology.write().take();
        if let Some(topology) = topology {
            topology.sentinels.dispose();
            topology.ms.dispose();
        }
        log::debug!("Sentinel manager disposed");
    }
}

impl SentinelObserver for ManagerInner {
    fn on_event(&self, source: &Endpoint, event: SentinelEvent) {
        if let Some(name) = &self.settings.master_name
            && !event.master_name().is_empty()
            && event.master_name() != name
        {
            log::debug!(
                "Ignoring event from {} for master {}",
                source,
                event.master_name()
            );
            return;
        }
        let Some(topology) = self.current() else {
            return;
        };

        match &event {
            SentinelEvent::MasterSwitched { old, new, .. } => {
                self.on_master_switched(&topology, old, new)
            }
            SentinelEvent::InstanceStateChanged {
                event: down,
                instance_type,
                endpoint,
                ..
            } => self.on_instance_state_changed(&topology, *down, *instance_type, endpoint),
        }

        let hook = self.event_hook.read().clone();
        if let Some(hook) = hook {
            hook(&event);
        }
    }

    fn on_disconnected(&self, source: &Endpoint) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        let source = source.clone();
        tokio::spawn(async move {
            let Some(topology) = inner.current() else {
                return;
            };
            if let Some(node) = topology.sentinels.group().find(&source) {
                let alive = node.ping().await;
                log::info!(
                    "Sentinel {} {} after losing its subscription",
                    source,
                    if alive { "answers" } else { "is unreachable" }
                );
            }
            topology.sentinels.resubscribe().await;
        });
    }
}

/// Resets `init_state` when discovery did not finish
struct InitGuard<'a> {
    state: &'a AtomicU8,
    done: bool,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        let state = if self.done {
            STATE_INITIALIZED
        } else {
            STATE_UNDEFINED
        };
        self.state.store(state, Ordering::Release);
    }
}

struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Move the pools (or listeners) of nodes that survive into the matching
/// new nodes. Returns the endpoints whose seeds were moved.
fn transplant(old: &NodesGroup, fresh: &[Arc<ManagedNode>]) -> HashSet<Endpoint> {
    let lookup: HashMap<Endpoint, Arc<ManagedNode>> = old
        .nodes()
        .into_iter()
        .filter(|n| !n.is_disposed())
        .map(|n| (n.endpoint(), n))
        .collect();

    let mut kept = HashSet::new();
    for node in fresh {
        let endpoint = node.endpoint();
        let Some(previous) = lookup.get(&endpoint) else {
            continue;
        };
        match node.exchange_seed(previous.seed()) {
            Ok(unused) => {
                unused.dispose();
                kept.insert(endpoint);
            }
            Err(e) => log::warn!("Cannot reuse the {} at {}: {}", previous.seed().kind(), endpoint, e),
        }
    }
    kept
}

/// Dispose a displaced group; nodes whose seed now lives elsewhere give
/// up ownership first
fn retire(old: &NodesGroup, kept: &HashSet<Endpoint>) {
    for node in old.nodes() {
        if kept.contains(&node.endpoint()) {
            node.set_owns_seed(false);
        }
    }
    old.dispose();
}
