//! Subscription manager for broadcasting live items.

use crate::types::DomainItem;
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::subscription::Subscription;
use super::types::{SubscriptionConfig, SubscriptionFilter, SubscriptionId};

/// Why a live subscription left the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Queue overflowed (slow consumer).
    BufferOverflow,
    /// No item within the live-data timeout.
    Idle,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The subscription finished on its own (cancelled by the consumer).
    Finished,
}

/// Internal live subscription state.
struct LiveSubscription {
    filter: SubscriptionFilter,
    subscription: Arc<Subscription<DomainItem>>,
    last_activity: Mutex<Instant>,
}

/// Registers live subscriptions and broadcasts feed items to them.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, LiveSubscription>>,
    config: SubscriptionConfig,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new() -> Self {
        Self::with_config(SubscriptionConfig::default())
    }

    pub fn with_config(config: SubscriptionConfig) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Attach a subscription to the live feed.
    pub fn subscribe(
        &self,
        filter: SubscriptionFilter,
        subscription: Arc<Subscription<DomainItem>>,
    ) -> SubscriptionId {
        let id = subscription.id();
        let live = LiveSubscription {
            filter,
            subscription,
            last_activity: Mutex::new(Instant::now()),
        };

        self.subscriptions.write().insert(id, live);
        debug!(subscription = %id, "live subscription registered");
        id
    }

    /// Detach and cancel a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.remove(id, DropReason::Unsubscribed);
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    // --- Broadcasting ---

    /// Push a live item to every matching subscription.
    ///
    /// Subscribers already `max_buffered` items behind are dropped instead
    /// of buffering without bound. Returns how many subscriptions took the item.
    pub fn broadcast(&self, item: &DomainItem) -> usize {
        let mut to_remove = Vec::new();
        let mut delivered = 0;

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if sub.subscription.is_done() {
                    to_remove.push((*id, DropReason::Finished));
                    continue;
                }
                if !sub.filter.matches(item) {
                    continue;
                }
                if sub.subscription.queued() >= self.config.max_buffered {
                    to_remove.push((*id, DropReason::BufferOverflow));
                    continue;
                }
                if sub.subscription.push(item.clone(), false) {
                    *sub.last_activity.lock() = Instant::now();
                    delivered += 1;
                }
            }
        }

        for (id, reason) in to_remove {
            self.remove(id, reason);
        }

        delivered
    }

    /// Complete subscriptions that received nothing for `idle`.
    /// Returns how many were completed.
    pub fn complete_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<SubscriptionId> = self
            .subscriptions
            .read()
            .iter()
            .filter(|(_, sub)| now.duration_since(*sub.last_activity.lock()) >= idle)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.remove(*id, DropReason::Idle);
        }
        expired.len()
    }

    /// End every live subscription normally (the feed is shutting down).
    pub fn complete_all(&self) {
        let subs: Vec<LiveSubscription> = self.subscriptions.write().drain().map(|(_, s)| s).collect();
        for sub in subs {
            sub.subscription.complete();
        }
    }

    fn remove(&self, id: SubscriptionId, reason: DropReason) {
        let Some(sub) = self.subscriptions.write().remove(&id) else {
            return;
        };

        match reason {
            DropReason::BufferOverflow => {
                warn!(subscription = %id, queued = sub.subscription.queued(), "dropping slow subscriber");
                sub.subscription.cancel();
            }
            DropReason::Idle => {
                info!(subscription = %id, "live data timeout, completing subscription");
                sub.subscription.complete();
            }
            DropReason::Unsubscribed => {
                debug!(subscription = %id, "unsubscribed");
                sub.subscription.cancel();
            }
            DropReason::Finished => {
                debug!(subscription = %id, "subscription finished");
            }
        }
    }

    /// Start a background thread completing idle subscriptions every
    /// `check_interval`, using the configured live-data timeout. Returns
    /// `None` when no timeout is configured.
    pub fn spawn_idle_reaper(self: &Arc<Self>, check_interval: Duration) -> Option<IdleReaper> {
        let idle = self.config.live_timeout()?;
        let manager: Weak<Self> = Arc::downgrade(self);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(check_interval);

        let handle = thread::Builder::new()
            .name("sensorstream-reaper".into())
            .spawn(move || loop {
                select! {
                    recv(shutdown_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.complete_idle(idle);
                    }
                }
            })
            .ok()?;

        Some(IdleReaper {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the idle reaper thread. Stops the thread when dropped.
pub struct IdleReaper {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IdleReaper {
    pub fn stop(mut self) {
        self.shutdown_now();
    }

    fn shutdown_now(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, StreamError};
    use crate::subscriptions::{Subscriber, UNBOUNDED};
    use crate::types::{ItemKind, ResultRecord, Timestamp};

    #[derive(Default)]
    struct Collector {
        items: Mutex<Vec<DomainItem>>,
        completed: Mutex<bool>,
        demand: u64,
    }

    impl Subscriber<DomainItem> for Collector {
        fn on_subscribe(&self, subscription: Arc<Subscription<DomainItem>>) {
            if self.demand > 0 {
                subscription.request(self.demand);
            }
        }
        fn on_next(&self, _seq: u64, item: DomainItem) -> Result<()> {
            self.items.lock().push(item);
            Ok(())
        }
        fn on_complete(&self) {
            *self.completed.lock() = true;
        }
        fn on_error(&self, _error: StreamError) {}
    }

    fn collector(demand: u64) -> Arc<Collector> {
        Arc::new(Collector {
            demand,
            ..Default::default()
        })
    }

    fn record(t: i64) -> DomainItem {
        ResultRecord::new(Timestamp(t), vec![]).into()
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let manager = SubscriptionManager::new();
        let sub = Subscription::subscribe(collector(0));

        let id = manager.subscribe(SubscriptionFilter::all(), sub.clone());
        assert_eq!(manager.subscription_count(), 1);

        manager.unsubscribe(id);
        assert_eq!(manager.subscription_count(), 0);
        assert!(sub.is_done());
    }

    #[test]
    fn test_broadcast_to_matching() {
        let manager = SubscriptionManager::new();
        let results = collector(UNBOUNDED);
        let procedures = collector(UNBOUNDED);

        manager.subscribe(
            SubscriptionFilter::kinds(vec![ItemKind::Result]),
            Subscription::subscribe(results.clone()),
        );
        manager.subscribe(
            SubscriptionFilter::kinds(vec![ItemKind::Procedure]),
            Subscription::subscribe(procedures.clone()),
        );

        assert_eq!(manager.broadcast(&record(1)), 1);
        assert_eq!(results.items.lock().len(), 1);
        assert!(procedures.items.lock().is_empty());
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let manager = SubscriptionManager::with_config(SubscriptionConfig {
            max_buffered: 2,
            ..Default::default()
        });
        let slow = Subscription::subscribe(collector(0));
        manager.subscribe(SubscriptionFilter::all(), slow.clone());

        for i in 0..10 {
            manager.broadcast(&record(i));
        }

        assert_eq!(manager.subscription_count(), 0);
        assert!(slow.is_done());
        assert_eq!(slow.queued(), 0);
    }

    #[test]
    fn test_complete_idle() {
        let manager = SubscriptionManager::new();
        let live = collector(UNBOUNDED);
        manager.subscribe(SubscriptionFilter::all(), Subscription::subscribe(live.clone()));

        assert_eq!(manager.complete_idle(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(manager.complete_idle(Duration::from_millis(10)), 1);
        assert!(*live.completed.lock());
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_idle_reaper() {
        let manager = Arc::new(SubscriptionManager::with_config(SubscriptionConfig {
            live_timeout_ms: Some(30),
            ..Default::default()
        }));
        let live = collector(UNBOUNDED);
        manager.subscribe(SubscriptionFilter::all(), Subscription::subscribe(live.clone()));

        let reaper = manager.spawn_idle_reaper(Duration::from_millis(10)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.subscription_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        reaper.stop();

        assert!(*live.completed.lock());
    }

    #[test]
    fn test_no_reaper_without_timeout() {
        let manager = Arc::new(SubscriptionManager::new());
        assert!(manager.spawn_idle_reaper(Duration::from_millis(10)).is_none());
    }
}
