//! Versioned update notifications within and across tabs
//!
//! A [`Broadcaster`] carries change notifications for cache records behind
//! a single subscription surface. Updates arrive over two transports:
//!
//! - Same-tab writes are announced synchronously through
//!   [`Broadcaster::publish`], called by the cache layer right after it
//!   persists a record.
//! - Other tabs' writes arrive through the origin store's change signal; a
//!   background task decodes each changed cache record and feeds it into
//!   the same dispatch path.
//!
//! Subscribers cannot tell which transport an update took. The dispatch
//! path keeps the last delivered version per key and drops any update that
//! does not advance it, so duplicated or reordered deliveries collapse to
//! exactly one notification per `(key, version)` pair and a late-arriving
//! older version is never surfaced after a newer one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::cache::entry::{StoredRecord, CACHE_KEY_PREFIX};
use crate::store::TabHandle;

/// A change notification for one cache record.
#[derive(Debug, Clone)]
pub struct CacheUpdate {
    /// Logical cache key, without the store prefix.
    pub key: String,
    /// Version of the record the update describes.
    pub version: u64,
    /// Write instant of the record.
    pub as_of: DateTime<Utc>,
}

type Handler = Arc<dyn Fn(&CacheUpdate) + Send + Sync>;

struct Registration {
    id: u64,
    /// `None` subscribes to every key.
    key: Option<String>,
    handler: Handler,
}

struct BroadcasterInner {
    subscribers: RwLock<Vec<Registration>>,
    delivered: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
}

impl BroadcasterInner {
    /// Runs an update through the version filter and, if it passes, hands
    /// it to every matching subscriber.
    fn dispatch(&self, update: CacheUpdate) {
        {
            let mut delivered = match self.delivered.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let last = delivered.get(&update.key).copied().unwrap_or(0);
            if update.version <= last {
                debug!(
                    key = %update.key,
                    version = update.version,
                    delivered = last,
                    "stale update dropped"
                );
                return;
            }
            delivered.insert(update.key.clone(), update.version);
        }

        // Handlers run outside the subscriber lock so they may subscribe or
        // unsubscribe without deadlocking.
        let handlers: Vec<Handler> = {
            let subscribers = match self.subscribers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            subscribers
                .iter()
                .filter(|r| r.key.as_deref().map_or(true, |k| k == update.key))
                .map(|r| Arc::clone(&r.handler))
                .collect()
        };

        trace!(key = %update.key, version = update.version, handlers = handlers.len(), "delivering update");
        for handler in handlers {
            handler(&update);
        }
    }

    /// Turns a raw store event into an update, when it describes a cache
    /// record we can read.
    fn on_store_event(&self, key: &str, new_value: Option<String>) {
        let Some(logical_key) = key.strip_prefix(CACHE_KEY_PREFIX) else {
            return;
        };
        let Some(raw) = new_value else {
            // Removals carry no version and are not update notifications.
            return;
        };
        match StoredRecord::parse(&raw) {
            Ok(record) => self.dispatch(CacheUpdate {
                key: logical_key.to_string(),
                version: record.version,
                as_of: record.created_at(),
            }),
            Err(e) => {
                debug!(key, error = %e, "ignoring unreadable store event");
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut subscribers = match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|r| r.id != id);
    }
}

/// Update notification hub for one tab.
///
/// Must be created inside a Tokio runtime; construction spawns the listener
/// task that watches the origin store for other tabs' writes.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Broadcaster {
    /// Creates a broadcaster for the tab behind `tab`.
    pub fn new(tab: &TabHandle) -> Self {
        let inner = Arc::new(BroadcasterInner {
            subscribers: RwLock::new(Vec::new()),
            delivered: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        let weak: Weak<BroadcasterInner> = Arc::downgrade(&inner);
        let mut changes = tab.changes();
        tokio::spawn(async move {
            while let Some(event) = changes.next().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_store_event(&event.key, event.new_value);
            }
            trace!("cross-tab listener finished");
        });

        Self { inner }
    }

    /// Announces a locally written update.
    ///
    /// Delivery is synchronous: matching handlers have run by the time this
    /// returns. The call itself never fails; an update that does not
    /// advance the key's version is logged and dropped.
    pub fn publish(&self, update: CacheUpdate) {
        self.inner.dispatch(update);
    }

    /// Subscribes `handler` to updates for one key.
    ///
    /// The returned [`Subscription`] unsubscribes when dropped.
    pub fn subscribe(
        &self,
        key: impl Into<String>,
        handler: impl Fn(&CacheUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(Some(key.into()), Arc::new(handler))
    }

    /// Subscribes `handler` to updates for every key.
    pub fn subscribe_all(
        &self,
        handler: impl Fn(&CacheUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, key: Option<String>, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscribers = match self.inner.subscribers.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            subscribers.push(Registration { id, key, handler });
        }
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Last delivered version for a key, if any update has been delivered.
    pub fn delivered_version(&self, key: &str) -> Option<u64> {
        let delivered = match self.inner.delivered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        delivered.get(key).copied()
    }
}

/// Keeps one subscriber registered; dropping it unsubscribes.
pub struct Subscription {
    inner: Weak<BroadcasterInner>,
    id: u64,
}

impl Subscription {
    /// Unsubscribes explicitly. Equivalent to dropping the subscription.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::record_key;
    use crate::store::Origin;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn update(key: &str, version: u64) -> CacheUpdate {
        CacheUpdate {
            key: key.to_string(),
            version,
            as_of: Utc::now(),
        }
    }

    fn record_json(version: u64) -> String {
        let now = Utc::now().timestamp_millis();
        StoredRecord {
            data: serde_json::json!({"v": version}),
            timestamp: now,
            expires_at: now + 60_000,
            version,
        }
        .to_json()
        .unwrap()
    }

    async fn wait_for_count(counter: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} deliveries, saw {}",
            expected,
            counter.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_publish_delivers_synchronously() {
        let origin = Origin::in_memory();
        let tab = origin.attach();
        let broadcaster = Broadcaster::new(&tab);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = broadcaster.subscribe("shifts", move |u| {
            seen_clone.lock().unwrap().push(u.version);
        });

        broadcaster.publish(update("shifts", 1));
        // Synchronous transport: observed immediately, no waiting.
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_versions_dropped() {
        let origin = Origin::in_memory();
        let tab = origin.attach();
        let broadcaster = Broadcaster::new(&tab);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = broadcaster.subscribe("shifts", move |u| {
            seen_clone.lock().unwrap().push(u.version);
        });

        broadcaster.publish(update("shifts", 2));
        broadcaster.publish(update("shifts", 2));
        broadcaster.publish(update("shifts", 1));
        broadcaster.publish(update("shifts", 3));

        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
        assert_eq!(broadcaster.delivered_version("shifts"), Some(3));
    }

    #[tokio::test]
    async fn test_version_filter_is_per_key() {
        let origin = Origin::in_memory();
        let tab = origin.attach();
        let broadcaster = Broadcaster::new(&tab);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = broadcaster.subscribe_all(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        broadcaster.publish(update("a", 5));
        broadcaster.publish(update("b", 1));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_key_subscription_ignores_other_keys() {
        let origin = Origin::in_memory();
        let tab = origin.attach();
        let broadcaster = Broadcaster::new(&tab);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = broadcaster.subscribe("mine", move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        broadcaster.publish(update("other", 1));
        broadcaster.publish(update("mine", 1));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let origin = Origin::in_memory();
        let tab = origin.attach();
        let broadcaster = Broadcaster::new(&tab);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let sub = broadcaster.subscribe("shifts", move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        broadcaster.publish(update("shifts", 1));
        drop(sub);
        broadcaster.publish(update("shifts", 2));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cross_tab_updates_delivered() {
        let origin = Origin::in_memory();
        let ours = origin.attach();
        let theirs = origin.attach();
        let broadcaster = Broadcaster::new(&ours);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = broadcaster.subscribe("shifts", move |u| {
            assert_eq!(u.version, 4);
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        theirs
            .save(&record_key("shifts"), record_json(4))
            .await
            .unwrap();

        wait_for_count(&count, 1).await;
    }

    #[tokio::test]
    async fn test_cross_tab_transport_applies_version_filter() {
        let origin = Origin::in_memory();
        let ours = origin.attach();
        let theirs = origin.attach();
        let broadcaster = Broadcaster::new(&ours);

        let versions = Arc::new(Mutex::new(Vec::new()));
        let versions_clone = Arc::clone(&versions);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = broadcaster.subscribe("shifts", move |u| {
            versions_clone.lock().unwrap().push(u.version);
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        // A misbehaving writer persists version 3, then an older 2.
        theirs
            .save(&record_key("shifts"), record_json(3))
            .await
            .unwrap();
        theirs
            .save(&record_key("shifts"), record_json(2))
            .await
            .unwrap();
        theirs
            .save(&record_key("shifts"), record_json(5))
            .await
            .unwrap();

        wait_for_count(&count, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*versions.lock().unwrap(), vec![3, 5]);
    }

    #[tokio::test]
    async fn test_non_cache_and_malformed_events_ignored() {
        let origin = Origin::in_memory();
        let ours = origin.attach();
        let theirs = origin.attach();
        let broadcaster = Broadcaster::new(&ours);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = broadcaster.subscribe_all(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        theirs
            .save("session_revocations", "[]".to_string())
            .await
            .unwrap();
        theirs
            .save(&record_key("bad"), "{broken".to_string())
            .await
            .unwrap();
        theirs
            .save(&record_key("good"), record_json(1))
            .await
            .unwrap();

        wait_for_count(&count, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
