//! Sentinel nodes and their notification subscriptions

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::endpoint::Endpoint;
use super::group::NodesGroup;
use super::notification::{SentinelEvent, TOPICS, parse_notification};
use crate::client::{Notification, NotificationChannel, SubscriptionHandler};

/// Receives decoded sentinel events
pub trait SentinelObserver: Send + Sync {
    fn on_event(&self, source: &Endpoint, event: SentinelEvent);

    /// A sentinel's subscription connection dropped
    fn on_disconnected(&self, source: &Endpoint);
}

/// Bridges raw pub/sub messages to the observer
struct EventRelay {
    observer: Weak<dyn SentinelObserver>,
}

impl SubscriptionHandler for EventRelay {
    fn on_message(&self, source: &Endpoint, message: Notification) {
        let Some(observer) = self.observer.upgrade() else {
            return;
        };
        match parse_notification(&message.channel, &message.data) {
            Some(event) => observer.on_event(source, event),
            None => log::debug!(
                "Ignoring {} message from {}: {:?}",
                message.channel,
                source,
                message.data
            ),
        }
    }

    fn on_disconnect(&self, source: &Endpoint) {
        if let Some(observer) = self.observer.upgrade() {
            observer.on_disconnected(source);
        }
    }
}

pub struct SentinelGroup {
    group: RwLock<Arc<NodesGroup>>,
    monitoring: AtomicBool,
    relay: RwLock<Option<Arc<EventRelay>>>,
    /// Subscriptions by sentinel endpoint
    channels: Mutex<HashMap<Endpoint, Arc<dyn NotificationChannel>>>,
}

impl SentinelGroup {
    pub fn new(group: Arc<NodesGroup>) -> Self {
        Self {
            group: RwLock::new(group),
            monitoring: AtomicBool::new(false),
            relay: RwLock::new(None),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn group(&self) -> Arc<NodesGroup> {
        self.group.read().clone()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Acquire)
    }

    /// Endpoints with an active subscription
    pub fn monitored(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .channels
            .lock()
            .iter()
            .filter(|(_, ch)| ch.is_active())
            .map(|(ep, _)| ep.clone())
            .collect();
        endpoints.sort();
        endpoints
    }

    /// Subscribe every live sentinel to `TOPICS`. A second call while
    /// already monitoring does nothing. Returns the number of new
    /// subscriptions.
    pub async fn monitor(&self, observer: Weak<dyn SentinelObserver>) -> usize {
        if self
            .monitoring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        *self.relay.write() = Some(Arc::new(EventRelay { observer }));
        self.resubscribe().await
    }

    /// Subscribe sentinels that have no active subscription yet
    pub async fn resubscribe(&self) -> usize {
        if !self.is_monitoring() {
            return 0;
        }
        let Some(relay) = self.relay.read().clone() else {
            return 0;
        };

        let mut subscribed = 0;
        for node in self.group().nodes() {
            if node.is_closed() {
                continue;
            }
            let endpoint = node.endpoint();
            let has_active = self
                .channels
                .lock()
                .get(&endpoint)
                .is_some_and(|ch| ch.is_active());
            if has_active {
                continue;
            }
            let Some(listener) = node.listener() else {
                continue;
            };

            let handler: Arc<dyn SubscriptionHandler> = relay.clone();
            match listener.subscribe(handler, &TOPICS).await {
                Ok(channel) => {
                    // quit() may have run while we were subscribing
                    if !self.is_monitoring() {
                        channel.unsubscribe();
                        break;
                    }
                    if let Some(stale) = self.channels.lock().insert(endpoint.clone(), channel) {
                        stale.unsubscribe();
                    }
                    log::info!("Monitoring sentinel {}", endpoint);
                    subscribed += 1;
                }
                Err(e) => log::warn!("Cannot subscribe to sentinel {}: {}", endpoint, e),
            }
        }
        subscribed
    }

    /// Install a new sentinel group. Subscriptions of sentinels missing from
    /// the new group are dropped; the displaced group is returned for
    /// disposal.
    pub fn exchange_group(&self, group: Arc<NodesGroup>) -> Arc<NodesGroup> {
        let previous = {
            let mut current = self.group.write();
            if let Some(handler) = current.take_pulse_handler() {
                group.set_pulse_handler(Some(handler));
            }
            std::mem::replace(&mut *current, group.clone())
        };

        let mut channels = self.channels.lock();
        channels.retain(|endpoint, channel| {
            let keep = group.find(endpoint).is_some();
            if !keep {
                channel.unsubscribe();
            }
            keep
        });
        previous
    }

    /// Drop every subscription. Idempotent.
    pub fn quit(&self) {
        if !self.monitoring.swap(false, Ordering::AcqRel) {
            return;
        }
        self.relay.write().take();
        let channels: Vec<_> = self.channels.lock().drain().collect();
        for (endpoint, channel) in channels {
            channel.unsubscribe();
            log::debug!("Stopped monitoring sentinel {}", endpoint);
        }
    }

    pub fn dispose(&self) {
        self.quit();
        self.group().dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ha::endpoint::Role;
    use crate::ha::mock::MockListener;
    use crate::ha::node::{ManagedNode, Seed};
    use crate::ha::notification::{SWITCH_MASTER, SDOWN_ENTER};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<SentinelEvent>>,
        disconnects: Mutex<Vec<Endpoint>>,
    }

    impl SentinelObserver for Recorder {
        fn on_event(&self, _source: &Endpoint, event: SentinelEvent) {
            self.events.lock().push(event);
        }

        fn on_disconnected(&self, source: &Endpoint) {
            self.disconnects.lock().push(source.clone());
        }
    }

    fn sentinels(ports: &[u16]) -> (SentinelGroup, Vec<Arc<MockListener>>) {
        let listeners: Vec<_> = ports
            .iter()
            .map(|p| MockListener::new(Endpoint::new("127.0.0.1", *p)))
            .collect();
        let nodes = listeners
            .iter()
            .map(|l| Arc::new(ManagedNode::new(Role::Sentinel, Seed::Listener(l.clone()))))
            .collect();
        let group = SentinelGroup::new(Arc::new(NodesGroup::new(Role::Sentinel, nodes, None)));
        (group, listeners)
    }

    fn observer(recorder: &Arc<Recorder>) -> Weak<dyn SentinelObserver> {
        let as_dyn: Arc<dyn SentinelObserver> = recorder.clone();
        Arc::downgrade(&as_dyn)
    }

    #[tokio::test]
    async fn test_monitor_is_idempotent() {
        let (group, listeners) = sentinels(&[26379, 26380]);
        let recorder = Arc::new(Recorder::default());

        assert_eq!(group.monitor(observer(&recorder)).await, 2);
        assert_eq!(group.monitor(observer(&recorder)).await, 0);
        assert!(listeners.iter().all(|l| l.subscribe_count() == 1));
        assert_eq!(listeners[0].subscribed_channels(), TOPICS.to_vec());
        assert_eq!(group.monitored().len(), 2);
    }

    #[tokio::test]
    async fn test_messages_reach_observer() {
        let (group, listeners) = sentinels(&[26379]);
        let recorder = Arc::new(Recorder::default());
        group.monitor(observer(&recorder)).await;

        listeners[0].publish(SWITCH_MASTER, "mymaster 127.0.0.1 6379 127.0.0.1 6380");
        listeners[0].publish(SDOWN_ENTER, "garbage");
        listeners[0].publish(SDOWN_ENTER, "master mymaster 127.0.0.1 6380");

        let events = recorder.events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SentinelEvent::MasterSwitched { .. }));
    }

    #[tokio::test]
    async fn test_quit_unsubscribes_everything() {
        let (group, listeners) = sentinels(&[26379, 26380]);
        let recorder = Arc::new(Recorder::default());
        group.monitor(observer(&recorder)).await;

        group.quit();
        group.quit();
        assert!(!group.is_monitoring());
        assert!(group.monitored().is_empty());
        assert!(listeners.iter().all(|l| l.active_subscriptions() == 0));

        // monitoring again after quit subscribes afresh
        assert_eq!(group.monitor(observer(&recorder)).await, 2);
    }

    #[tokio::test]
    async fn test_skips_unreachable_and_resubscribes() {
        let (group, listeners) = sentinels(&[26379, 26380]);
        listeners[1].set_alive(false);
        let recorder = Arc::new(Recorder::default());

        assert_eq!(group.monitor(observer(&recorder)).await, 1);

        listeners[0].drop_connections();
        assert_eq!(*recorder.disconnects.lock(), vec![Endpoint::new("127.0.0.1", 26379)]);
        assert!(group.monitored().is_empty());

        listeners[1].set_alive(true);
        assert_eq!(group.resubscribe().await, 2);
        assert_eq!(group.monitored().len(), 2);
    }

    #[tokio::test]
    async fn test_exchange_group_drops_removed_sentinels() {
        let (group, listeners) = sentinels(&[26379, 26380]);
        let recorder = Arc::new(Recorder::default());
        group.monitor(observer(&recorder)).await;

        let kept = group.group().find(&Endpoint::new("127.0.0.1", 26379)).unwrap();
        let previous =
            group.exchange_group(Arc::new(NodesGroup::new(Role::Sentinel, vec![kept], None)));
        assert_eq!(previous.len(), 2);
        assert_eq!(group.monitored(), vec![Endpoint::new("127.0.0.1", 26379)]);
        assert_eq!(listeners[1].active_subscriptions(), 0);
    }
}
