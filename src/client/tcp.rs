//! Default socket-backed collaborators
//!
//! One `TcpPool` per master/slave endpoint and one `TcpSentinelListener` per
//! pub/sub source. Every subscription and MONITOR stream owns a dedicated
//! connection with its own receive task.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{
    Connection, Listener, MonitorChannel, MonitorHandler, Notification, NotificationChannel, Pool,
    PoolFlags, SubscriptionHandler, Transport,
};
use crate::config::HaSettings;
use crate::error::{Error, Result};
use crate::ha::endpoint::Endpoint;
use crate::protocol::{Parser, RespValue, encode_command, write_command};

/// Initial read buffer size
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Per-socket options shared by every adapter
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from(&HaSettings::default())
    }
}

impl From<&HaSettings> for ConnectOptions {
    fn from(settings: &HaSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            command_timeout: settings.command_timeout,
            username: settings.username.clone(),
            password: settings.password.clone(),
        }
    }
}

/// Valid replies: +PONG, -LOADING, -MASTERDOWN
pub fn is_valid_ping_reply(reply: &RespValue) -> bool {
    match reply {
        RespValue::SimpleString(s) => s.eq_ignore_ascii_case(b"PONG"),
        RespValue::Error(e) => e.starts_with(b"LOADING") || e.starts_with(b"MASTERDOWN"),
        _ => false,
    }
}

/// A single RESP connection
pub struct TcpConnection {
    endpoint: Endpoint,
    db: usize,
    stream: TcpStream,
    buf: BytesMut,
    command_timeout: Duration,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("endpoint", &self.endpoint)
            .field("db", &self.db)
            .finish()
    }
}

impl TcpConnection {
    pub async fn connect(endpoint: &Endpoint, options: &ConnectOptions) -> Result<Self> {
        let stream = timeout(
            options.connect_timeout,
            TcpStream::connect((endpoint.host(), endpoint.port())),
        )
        .await?
        .map_err(|e| Error::Connection(format!("{}: {}", endpoint, e)))?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            endpoint: endpoint.clone(),
            db: 0,
            stream,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            command_timeout: options.command_timeout,
        };

        if let Some(password) = &options.password {
            let reply = match &options.username {
                Some(user) => conn.call(&["AUTH", user.as_str(), password.as_str()]).await?,
                None => conn.call(&["AUTH", password.as_str()]).await?,
            };
            if let RespValue::Error(e) = reply {
                return Err(Error::Connection(format!(
                    "AUTH to {} failed: {}",
                    endpoint,
                    String::from_utf8_lossy(&e)
                )));
            }
        }

        Ok(conn)
    }

    async fn call(&mut self, args: &[&str]) -> Result<RespValue> {
        self.write(&encode_command(args)).await?;
        self.read_reply_timeout().await
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Read one reply, waiting as long as it takes (pub/sub and MONITOR)
    async fn read_reply(&mut self) -> Result<RespValue> {
        loop {
            if let Some(value) = Parser::parse(&mut self.buf)? {
                return Ok(value);
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(Error::Connection(format!(
                    "{} closed the connection",
                    self.endpoint
                )));
            }
        }
    }

    async fn read_reply_timeout(&mut self) -> Result<RespValue> {
        let limit = self.command_timeout;
        timeout(limit, self.read_reply()).await?
    }

    fn track_select(&mut self, args: &[Bytes], reply: &RespValue) {
        if args.len() == 2
            && args[0].eq_ignore_ascii_case(b"SELECT")
            && matches!(reply, RespValue::SimpleString(_))
            && let Some(db) = std::str::from_utf8(&args[1])
                .ok()
                .and_then(|s| s.parse().ok())
        {
            self.db = db;
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn db_index(&self) -> usize {
        self.db
    }

    async fn execute(&mut self, args: &[Bytes]) -> Result<RespValue> {
        self.write(&encode_command(args)).await?;
        let reply = self.read_reply_timeout().await?;
        self.track_select(args, &reply);
        Ok(reply)
    }

    async fn execute_batch(&mut self, commands: &[Vec<Bytes>]) -> Result<Vec<RespValue>> {
        let mut out = BytesMut::new();
        for cmd in commands {
            write_command(&mut out, cmd.as_slice());
        }
        self.write(&out).await?;

        let mut replies = Vec::with_capacity(commands.len());
        for cmd in commands {
            let reply = self.read_reply_timeout().await?;
            self.track_select(cmd, &reply);
            replies.push(reply);
        }
        Ok(replies)
    }
}

struct PoolInner {
    endpoint: Endpoint,
    options: ConnectOptions,
    max_idle: usize,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    flags: PoolFlags,
}

impl PoolInner {
    fn release(&self, conn: Box<dyn Connection>) {
        if self.flags.is_disposed() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }
}

/// Bounded idle-connection pool for one endpoint
pub struct TcpPool {
    inner: Arc<PoolInner>,
    listener: Arc<TcpSentinelListener>,
}

impl TcpPool {
    pub fn new(endpoint: &Endpoint, options: ConnectOptions, max_idle: usize) -> Self {
        let listener = Arc::new(TcpSentinelListener::new(endpoint, options.clone()));
        Self {
            inner: Arc::new(PoolInner {
                endpoint: endpoint.clone(),
                options,
                max_idle: max_idle.max(1),
                idle: Mutex::new(Vec::new()),
                flags: PoolFlags::new(),
            }),
            listener,
        }
    }

    /// Take ownership of an already-open connection (discovery socket)
    pub fn adopt(&self, conn: Box<dyn Connection>) {
        self.inner.release(conn);
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }
}

#[async_trait]
impl Pool for TcpPool {
    fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    fn flags(&self) -> &PoolFlags {
        &self.inner.flags
    }

    async fn connect(&self, db: usize) -> Result<Box<dyn Connection>> {
        if self.inner.flags.is_disposed() {
            return Err(Error::Disposed("pool"));
        }

        let pooled = self.inner.idle.lock().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => match TcpConnection::connect(&self.inner.endpoint, &self.inner.options).await {
                Ok(conn) => {
                    self.inner.flags.set_disconnected(false);
                    Box::new(conn) as Box<dyn Connection>
                }
                Err(e) => {
                    self.inner.flags.set_disconnected(true);
                    return Err(e);
                }
            },
        };

        if conn.db_index() != db {
            let select = [Bytes::from_static(b"SELECT"), Bytes::from(db.to_string())];
            if let RespValue::Error(e) = conn.execute(&select).await? {
                return Err(Error::Server(String::from_utf8_lossy(&e).into_owned()));
            }
        }

        Ok(Box::new(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            broken: false,
        }))
    }

    async fn ping(&self) -> bool {
        if self.inner.flags.is_disposed() {
            return false;
        }
        let mut conn = match self.connect(0).await {
            Ok(conn) => conn,
            Err(e) => {
                log::debug!("PING {} failed to connect: {}", self.inner.endpoint, e);
                return false;
            }
        };
        match conn.execute(&[Bytes::from_static(b"PING")]).await {
            Ok(reply) => is_valid_ping_reply(&reply),
            Err(e) => {
                log::debug!("PING {} failed: {}", self.inner.endpoint, e);
                false
            }
        }
    }

    fn pubsub_channel(&self) -> Arc<dyn Listener> {
        self.listener.clone()
    }

    fn monitor_channel(&self) -> Arc<dyn MonitorChannel> {
        Arc::new(TcpMonitorChannel::new(
            &self.inner.endpoint,
            self.inner.options.clone(),
        ))
    }

    fn dispose(&self) {
        if self.inner.flags.mark_disposed() {
            self.inner.idle.lock().clear();
            self.listener.dispose();
        }
    }
}

/// Connection handed out by `TcpPool`; goes back to the idle list on drop
/// unless a command on it failed
struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    broken: bool,
}

#[async_trait]
impl Connection for PooledConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.pool.endpoint
    }

    fn db_index(&self) -> usize {
        self.conn.as_ref().map_or(0, |c| c.db_index())
    }

    async fn execute(&mut self, args: &[Bytes]) -> Result<RespValue> {
        let conn = self.conn.as_mut().ok_or(Error::Disposed("connection"))?;
        let result = conn.execute(args).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn execute_batch(&mut self, commands: &[Vec<Bytes>]) -> Result<Vec<RespValue>> {
        let conn = self.conn.as_mut().ok_or(Error::Disposed("connection"))?;
        let result = conn.execute_batch(commands).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take()
            && !self.broken
        {
            self.pool.release(conn);
        }
    }
}

/// Pub/sub source for one endpoint
pub struct TcpSentinelListener {
    endpoint: Endpoint,
    options: ConnectOptions,
    flags: PoolFlags,
    subscriptions: Mutex<Vec<Weak<TcpNotificationChannel>>>,
}

impl TcpSentinelListener {
    pub fn new(endpoint: &Endpoint, options: ConnectOptions) -> Self {
        Self {
            endpoint: endpoint.clone(),
            options,
            flags: PoolFlags::new(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    async fn open(&self) -> Result<TcpConnection> {
        match TcpConnection::connect(&self.endpoint, &self.options).await {
            Ok(conn) => {
                self.flags.set_disconnected(false);
                Ok(conn)
            }
            Err(e) => {
                self.flags.set_disconnected(true);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Listener for TcpSentinelListener {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn flags(&self) -> &PoolFlags {
        &self.flags
    }

    async fn ping(&self) -> bool {
        if self.flags.is_disposed() {
            return false;
        }
        let mut conn = match self.open().await {
            Ok(conn) => conn,
            Err(e) => {
                log::debug!("PING {} failed to connect: {}", self.endpoint, e);
                return false;
            }
        };
        match conn.call(&["PING"]).await {
            Ok(reply) => is_valid_ping_reply(&reply),
            Err(_) => false,
        }
    }

    async fn subscribe(
        &self,
        handler: Arc<dyn SubscriptionHandler>,
        channels: &[&str],
    ) -> Result<Arc<dyn NotificationChannel>> {
        if self.flags.is_disposed() {
            return Err(Error::Disposed("listener"));
        }
        let mut conn = self.open().await?;

        let mut args = Vec::with_capacity(channels.len() + 1);
        args.push("SUBSCRIBE");
        args.extend_from_slice(channels);
        conn.write(&encode_command(&args)).await?;

        for _ in channels {
            let confirmed = conn
                .read_reply_timeout()
                .await?
                .as_array()
                .and_then(|items| items.first())
                .and_then(|kind| kind.as_str())
                .is_some_and(|kind| kind.eq_ignore_ascii_case("subscribe"));
            if !confirmed {
                return Err(Error::Protocol(format!(
                    "unexpected SUBSCRIBE reply from {}",
                    self.endpoint
                )));
            }
        }

        let active = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(receive_loop(
            conn,
            self.endpoint.clone(),
            handler,
            active.clone(),
        ));
        let channel = Arc::new(TcpNotificationChannel {
            endpoint: self.endpoint.clone(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            active,
            task: Mutex::new(Some(task)),
        });

        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|s| s.strong_count() > 0);
        subscriptions.push(Arc::downgrade(&channel));

        Ok(channel)
    }

    fn dispose(&self) {
        if self.flags.mark_disposed() {
            for channel in self.subscriptions.lock().drain(..) {
                if let Some(channel) = channel.upgrade() {
                    channel.unsubscribe();
                }
            }
        }
    }
}

/// Decode a `message` / `pmessage` push
fn decode_message(reply: &RespValue) -> Option<Notification> {
    let items = reply.as_array()?;
    match items.first()?.as_str()? {
        "message" if items.len() == 3 => Some(Notification::new(
            items[1].as_str()?,
            items[2].as_str()?,
        )),
        "pmessage" if items.len() == 4 => Some(Notification::new(
            items[2].as_str()?,
            items[3].as_str()?,
        )),
        _ => None,
    }
}

async fn receive_loop(
    mut conn: TcpConnection,
    endpoint: Endpoint,
    handler: Arc<dyn SubscriptionHandler>,
    active: Arc<AtomicBool>,
) {
    loop {
        match conn.read_reply().await {
            Ok(reply) => {
                if let Some(message) = decode_message(&reply) {
                    handler.on_message(&endpoint, message);
                }
            }
            Err(e) => {
                if active.swap(false, Ordering::AcqRel) {
                    log::warn!("Subscription on {} dropped: {}", endpoint, e);
                    handler.on_disconnect(&endpoint);
                }
                return;
            }
        }
    }
}

/// Live subscription returned by `TcpSentinelListener::subscribe`
pub struct TcpNotificationChannel {
    endpoint: Endpoint,
    channels: Vec<String>,
    active: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationChannel for TcpNotificationChannel {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for TcpNotificationChannel {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// MONITOR stream on one endpoint
pub struct TcpMonitorChannel {
    endpoint: Endpoint,
    options: ConnectOptions,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpMonitorChannel {
    pub fn new(endpoint: &Endpoint, options: ConnectOptions) -> Self {
        Self {
            endpoint: endpoint.clone(),
            options,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MonitorChannel for TcpMonitorChannel {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn start(&self, handler: MonitorHandler) -> Result<()> {
        let mut conn = TcpConnection::connect(&self.endpoint, &self.options).await?;
        if let RespValue::Error(e) = conn.call(&["MONITOR"]).await? {
            return Err(Error::Server(String::from_utf8_lossy(&e).into_owned()));
        }

        let endpoint = self.endpoint.clone();
        let task = tokio::spawn(async move {
            loop {
                match conn.read_reply().await {
                    Ok(reply) => {
                        if let Some(line) = reply.as_str() {
                            handler(&endpoint, line.to_string());
                        }
                    }
                    Err(e) => {
                        log::debug!("MONITOR on {} ended: {}", endpoint, e);
                        return;
                    }
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for TcpMonitorChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds `TcpConnection`s, `TcpPool`s and `TcpSentinelListener`s
#[derive(Debug, Clone)]
pub struct TcpTransport {
    options: ConnectOptions,
    pool_size: usize,
}

impl TcpTransport {
    pub fn new(settings: &HaSettings) -> Self {
        Self {
            options: ConnectOptions::from(settings),
            pool_size: settings.pool_size,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
        Ok(Box::new(TcpConnection::connect(endpoint, &self.options).await?))
    }

    fn create_pool(&self, endpoint: &Endpoint, seed: Option<Box<dyn Connection>>) -> Arc<dyn Pool> {
        let pool = TcpPool::new(endpoint, self.options.clone(), self.pool_size);
        if let Some(seed) = seed {
            pool.adopt(seed);
        }
        Arc::new(pool)
    }

    fn create_listener(&self, endpoint: &Endpoint) -> Arc<dyn Listener> {
        Arc::new(TcpSentinelListener::new(endpoint, self.options.clone()))
    }
}
