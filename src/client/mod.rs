//! Client-side collaborators of the HA manager
//!
//! The manager never speaks to sockets directly. It consumes:
//! - `Pool`: per-endpoint connection source with down flags
//! - `Listener`: per-sentinel pub/sub source for notification channels
//! - `Transport`: factory for throwaway discovery connections, pools and listeners
//!
//! `tcp` holds the default implementations, `session` the handles given
//! back to callers.

pub mod flags;
pub mod session;
pub mod tcp;

#[cfg(test)]
pub(crate) mod fake;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::ha::endpoint::Endpoint;
use crate::protocol::RespValue;

pub use flags::PoolFlags;
pub use session::{Db, Pipeline, Transaction};
pub use tcp::{TcpConnection, TcpMonitorChannel, TcpPool, TcpSentinelListener, TcpTransport};

/// A single established connection
#[async_trait]
pub trait Connection: Send {
    fn endpoint(&self) -> &Endpoint;

    /// Database currently selected on this connection
    fn db_index(&self) -> usize;

    /// Send one command and read its reply. Error replies are returned as
    /// `RespValue::Error`, not as `Err`.
    async fn execute(&mut self, args: &[Bytes]) -> Result<RespValue>;

    /// Send every command, then read every reply in order
    async fn execute_batch(&mut self, commands: &[Vec<Bytes>]) -> Result<Vec<RespValue>> {
        let mut replies = Vec::with_capacity(commands.len());
        for cmd in commands {
            replies.push(self.execute(cmd).await?);
        }
        Ok(replies)
    }
}

/// Connection source for one master or slave endpoint
#[async_trait]
pub trait Pool: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    fn flags(&self) -> &PoolFlags;

    /// Hand out a connection with `db` selected
    async fn connect(&self, db: usize) -> Result<Box<dyn Connection>>;

    /// Liveness check; never fails, unreachable means `false`
    async fn ping(&self) -> bool;

    /// Pub/sub channel on this endpoint
    fn pubsub_channel(&self) -> Arc<dyn Listener>;

    /// MONITOR stream on this endpoint
    fn monitor_channel(&self) -> Arc<dyn MonitorChannel>;

    /// Release idle connections and refuse new ones. Repeated calls are no-ops.
    fn dispose(&self);
}

/// Decoded pub/sub message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub data: String,
}

impl Notification {
    pub fn new(channel: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            data: data.into(),
        }
    }
}

/// Receives messages from a subscription. Called from the channel's own
/// receive task: no ordering across channels, no backpressure.
pub trait SubscriptionHandler: Send + Sync {
    fn on_message(&self, source: &Endpoint, message: Notification);

    /// The subscription connection dropped
    fn on_disconnect(&self, _source: &Endpoint) {}
}

/// Pub/sub source, used for sentinel notification channels and for
/// caller-requested pub/sub channels
#[async_trait]
pub trait Listener: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    fn flags(&self) -> &PoolFlags;

    async fn ping(&self) -> bool;

    /// Subscribe `handler` to `channels` on a dedicated connection
    async fn subscribe(
        &self,
        handler: Arc<dyn SubscriptionHandler>,
        channels: &[&str],
    ) -> Result<Arc<dyn NotificationChannel>>;

    fn dispose(&self);
}

/// A live subscription
pub trait NotificationChannel: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    fn channels(&self) -> Vec<String>;

    fn is_active(&self) -> bool;

    /// Stop receiving; repeated calls are no-ops
    fn unsubscribe(&self);
}

/// Callback for MONITOR lines
pub type MonitorHandler = Arc<dyn Fn(&Endpoint, String) + Send + Sync>;

/// MONITOR stream on a data node
#[async_trait]
pub trait MonitorChannel: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    async fn start(&self, handler: MonitorHandler) -> Result<()>;

    fn stop(&self);
}

/// Factory for everything the manager needs to reach a server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a throwaway connection (topology discovery)
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>>;

    /// Pool for a master or slave; `seed` is an already-open connection
    /// the pool may adopt
    fn create_pool(&self, endpoint: &Endpoint, seed: Option<Box<dyn Connection>>)
    -> Arc<dyn Pool>;

    /// Listener for a sentinel
    fn create_listener(&self, endpoint: &Endpoint) -> Arc<dyn Listener>;
}
