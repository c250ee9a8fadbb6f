//! In-memory collaborators for tests

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::endpoint::Endpoint;
use crate::client::{
    Connection, Listener, MonitorChannel, MonitorHandler, Notification, NotificationChannel,
    Pool, PoolFlags, SubscriptionHandler, Transport,
};
use crate::error::{Error, Result};
use crate::protocol::RespValue;

#[derive(Default)]
struct ConnState {
    scripted: HashMap<String, RespValue>,
    queued: VecDeque<RespValue>,
    sent: Vec<String>,
}

/// Connection answering from a script. Clones share the script and the
/// log of sent commands.
#[derive(Clone)]
pub struct MockConnection {
    endpoint: Endpoint,
    db: usize,
    state: Arc<Mutex<ConnState>>,
}

impl MockConnection {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            db: 0,
            state: Arc::new(Mutex::new(ConnState::default())),
        }
    }

    pub fn with_db(&self, db: usize) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            db,
            state: self.state.clone(),
        }
    }

    /// Always answer `command` (space-joined, longest prefix wins) with `reply`
    pub fn script(&self, command: &str, reply: RespValue) {
        self.state.lock().scripted.insert(command.to_string(), reply);
    }

    /// Answer the next unscripted command with `reply`
    pub fn push_reply(&self, reply: RespValue) {
        self.state.lock().queued.push_back(reply);
    }

    pub fn sent_commands(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn db_index(&self) -> usize {
        self.db
    }

    async fn execute(&mut self, args: &[Bytes]) -> Result<RespValue> {
        let words: Vec<String> = args
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        let mut state = self.state.lock();
        state.sent.push(words.join(" "));

        for n in (1..=words.len()).rev() {
            if let Some(reply) = state.scripted.get(&words[..n].join(" ")) {
                return Ok(reply.clone());
            }
        }
        state.queued.pop_front().ok_or_else(|| {
            Error::Protocol(format!("no reply scripted for '{}'", words.join(" ")))
        })
    }
}

/// Pool with a switchable liveness
pub struct MockPool {
    endpoint: Endpoint,
    flags: PoolFlags,
    alive: AtomicBool,
    pings: AtomicUsize,
    disposals: AtomicUsize,
    conn: MockConnection,
    listener: Arc<MockListener>,
}

impl MockPool {
    pub fn new(endpoint: Endpoint) -> Arc<Self> {
        Arc::new(Self {
            conn: MockConnection::new(endpoint.clone()),
            listener: MockListener::new(endpoint.clone()),
            endpoint,
            flags: PoolFlags::new(),
            alive: AtomicBool::new(true),
            pings: AtomicUsize::new(0),
            disposals: AtomicUsize::new(0),
        })
    }

    /// A dead pool fails connects and pings and reports itself disconnected
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
        self.flags.set_disconnected(!alive);
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn dispose_count(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    /// Shares state with every connection this pool hands out
    pub fn connection(&self) -> MockConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl Pool for MockPool {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn flags(&self) -> &PoolFlags {
        &self.flags
    }

    async fn connect(&self, db: usize) -> Result<Box<dyn Connection>> {
        if self.flags.is_disposed() {
            return Err(Error::Disposed("pool"));
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!("{} refused", self.endpoint)));
        }
        Ok(Box::new(self.conn.with_db(db)))
    }

    async fn ping(&self) -> bool {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.alive.load(Ordering::SeqCst) && !self.flags.is_disposed()
    }

    fn pubsub_channel(&self) -> Arc<dyn Listener> {
        self.listener.clone()
    }

    fn monitor_channel(&self) -> Arc<dyn MonitorChannel> {
        Arc::new(MockMonitor {
            endpoint: self.endpoint.clone(),
            running: AtomicBool::new(false),
        })
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        self.flags.mark_disposed();
    }
}

pub struct MockChannel {
    endpoint: Endpoint,
    channels: Vec<String>,
    active: AtomicBool,
}

impl NotificationChannel for MockChannel {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn unsubscribe(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

type Subscription = (Arc<dyn SubscriptionHandler>, Arc<MockChannel>);

/// Listener whose messages are injected by the test
pub struct MockListener {
    endpoint: Endpoint,
    flags: PoolFlags,
    alive: AtomicBool,
    subscribe_calls: AtomicUsize,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MockListener {
    pub fn new(endpoint: Endpoint) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            flags: PoolFlags::new(),
            alive: AtomicBool::new(true),
            subscribe_calls: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
        self.flags.set_disconnected(!alive);
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .iter()
            .filter(|(_, ch)| ch.is_active())
            .count()
    }

    /// Channels of the most recent subscription
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .last()
            .map(|(_, ch)| ch.channels.clone())
            .unwrap_or_default()
    }

    fn active(&self) -> Vec<Subscription> {
        self.subscriptions
            .lock()
            .iter()
            .filter(|(_, ch)| ch.is_active())
            .cloned()
            .collect()
    }

    /// Deliver a message to every active subscription on `channel`
    pub fn publish(&self, channel: &str, data: &str) {
        for (handler, ch) in self.active() {
            if ch.channels.iter().any(|c| c == channel) {
                handler.on_message(&self.endpoint, Notification::new(channel, data));
            }
        }
    }

    /// Simulate the subscription connections dropping
    pub fn drop_connections(&self) {
        for (handler, ch) in self.active() {
            ch.unsubscribe();
            handler.on_disconnect(&self.endpoint);
        }
    }
}

#[async_trait]
impl Listener for MockListener {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn flags(&self) -> &PoolFlags {
        &self.flags
    }

    async fn ping(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.flags.is_disposed()
    }

    async fn subscribe(
        &self,
        handler: Arc<dyn SubscriptionHandler>,
        channels: &[&str],
    ) -> Result<Arc<dyn NotificationChannel>> {
        if self.flags.is_disposed() {
            return Err(Error::Disposed("listener"));
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!("{} refused", self.endpoint)));
        }
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(MockChannel {
            endpoint: self.endpoint.clone(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            active: AtomicBool::new(true),
        });
        self.subscriptions.lock().push((handler, channel.clone()));
        Ok(channel)
    }

    fn dispose(&self) {
        if self.flags.mark_disposed() {
            for (_, ch) in self.subscriptions.lock().iter() {
                ch.unsubscribe();
            }
        }
    }
}

pub struct MockMonitor {
    endpoint: Endpoint,
    running: AtomicBool,
}

#[async_trait]
impl MonitorChannel for MockMonitor {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn start(&self, handler: MonitorHandler) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        handler(&self.endpoint, "OK".to_string());
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Transport backed by scripted servers keyed by endpoint
pub struct MockTransport {
    servers: Mutex<HashMap<Endpoint, HashMap<String, RespValue>>>,
    pools: Mutex<Vec<Arc<MockPool>>>,
    listeners: Mutex<Vec<Arc<MockListener>>>,
    connects: AtomicUsize,
    /// Connects left that wait on `gate`
    stalled: AtomicUsize,
    gate: tokio::sync::Semaphore,
}

fn bulk(s: &str) -> RespValue {
    RespValue::bulk_string(s)
}

fn addr(ep: &Endpoint) -> Vec<RespValue> {
    vec![bulk(ep.host()), bulk(&ep.port().to_string())]
}

fn kv(name: &str, ep: &Endpoint) -> RespValue {
    RespValue::array(vec![
        bulk("name"),
        bulk(name),
        bulk("ip"),
        bulk(ep.host()),
        bulk("port"),
        bulk(&ep.port().to_string()),
    ])
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(HashMap::new()),
            pools: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            stalled: AtomicUsize::new(0),
            gate: tokio::sync::Semaphore::new(0),
        })
    }

    fn install(&self, ep: Endpoint, script: HashMap<String, RespValue>) {
        self.servers.lock().insert(ep.clone(), script);
        for pool in self.pools_at(&ep) {
            pool.set_alive(true);
        }
        for listener in self.listeners_at(&ep) {
            listener.set_alive(true);
        }
    }

    pub fn add_master(&self, ep: Endpoint, replicas: &[Endpoint]) {
        let replicas = replicas
            .iter()
            .map(|r| {
                let mut entry = addr(r);
                entry.push(bulk("0"));
                RespValue::array(entry)
            })
            .collect();
        let role = RespValue::array(vec![
            bulk("master"),
            RespValue::Integer(0),
            RespValue::array(replicas),
        ]);
        self.install(ep, HashMap::from([("ROLE".to_string(), role)]));
    }

    pub fn add_slave(&self, ep: Endpoint, master: Endpoint) {
        let mut role = vec![bulk("slave")];
        role.extend(addr(&master));
        role.push(bulk("connected"));
        role.push(RespValue::Integer(0));
        self.install(
            ep,
            HashMap::from([("ROLE".to_string(), RespValue::array(role))]),
        );
    }

    pub fn add_sentinel(&self, ep: Endpoint, master_name: &str, master: Endpoint, peers: &[Endpoint]) {
        let role = RespValue::array(vec![
            bulk("sentinel"),
            RespValue::array(vec![bulk(master_name)]),
        ]);
        let masters = RespValue::array(vec![kv(master_name, &master)]);
        let sentinels = RespValue::array(
            peers
                .iter()
                .map(|p| kv(&p.to_string(), p))
                .collect(),
        );
        self.install(
            ep,
            HashMap::from([
                ("ROLE".to_string(), role),
                ("SENTINEL MASTERS".to_string(), masters),
                (format!("SENTINEL SENTINELS {}", master_name), sentinels),
            ]),
        );
    }

    /// Stop answering at `ep`; pools and listeners already created for it go dead
    pub fn remove_server(&self, ep: &Endpoint) {
        self.servers.lock().remove(ep);
        for pool in self.pools_at(ep) {
            pool.set_alive(false);
        }
        for listener in self.listeners_at(ep) {
            listener.set_alive(false);
        }
    }

    /// The next `n` connects wait until `release_connects` (or forever)
    pub fn stall_connects(&self, n: usize) {
        self.stalled.store(n, Ordering::SeqCst);
    }

    pub fn release_connects(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn pools_at(&self, ep: &Endpoint) -> Vec<Arc<MockPool>> {
        self.pools
            .lock()
            .iter()
            .filter(|p| p.endpoint == *ep)
            .cloned()
            .collect()
    }

    pub fn listeners_at(&self, ep: &Endpoint) -> Vec<Arc<MockListener>> {
        self.listeners
            .lock()
            .iter()
            .filter(|l| l.endpoint == *ep)
            .cloned()
            .collect()
    }

    fn is_up(&self, ep: &Endpoint) -> bool {
        self.servers.lock().contains_key(ep)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self
            .stalled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
            && let Ok(permit) = self.gate.acquire().await
        {
            permit.forget();
        }
        let script = self
            .servers
            .lock()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::Connection(format!("{} refused", endpoint)))?;
        let conn = MockConnection::new(endpoint.clone());
        for (command, reply) in script {
            conn.script(&command, reply);
        }
        Ok(Box::new(conn))
    }

    fn create_pool(&self, endpoint: &Endpoint, _seed: Option<Box<dyn Connection>>) -> Arc<dyn Pool> {
        let pool = MockPool::new(endpoint.clone());
        pool.set_alive(self.is_up(endpoint));
        self.pools.lock().push(pool.clone());
        pool
    }

    fn create_listener(&self, endpoint: &Endpoint) -> Arc<dyn Listener> {
        let listener = MockListener::new(endpoint.clone());
        listener.set_alive(self.is_up(endpoint));
        self.listeners.lock().push(listener.clone());
        listener
    }
}
