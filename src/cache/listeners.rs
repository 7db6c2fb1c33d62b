//! Notification listeners and their registration handles.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use metrics::counter;
use time::OffsetDateTime;
use tracing::warn;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::listeners";
const METRIC_LISTENER_FAILURES: &str = "pulsecache_listener_failure_total";

/// Payload delivered to every listener after a write or an invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNotification {
    pub key: String,
    pub timestamp: OffsetDateTime,
}

/// Callback invoked synchronously on every notification.
///
/// Listeners run with no store lock held and may read or write the store. A
/// write made from a listener is notified after the current notification has
/// reached every listener.
pub type Listener = Arc<dyn Fn(&CacheNotification) + Send + Sync>;

/// Insertion-ordered listener registry.
///
/// Slots are keyed by a monotonically increasing id, so iteration order of the
/// map is registration order and removal never depends on callback identity.
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    slots: Mutex<BTreeMap<u64, Listener>>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn register(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        mutex_lock(&self.slots, SOURCE, "register").insert(id, listener);
        Subscription {
            id,
            listeners: Arc::downgrade(self),
            active: AtomicBool::new(true),
        }
    }

    fn remove(&self, id: u64) -> bool {
        mutex_lock(&self.slots, SOURCE, "remove")
            .remove(&id)
            .is_some()
    }

    pub(crate) fn len(&self) -> usize {
        mutex_lock(&self.slots, SOURCE, "len").len()
    }

    /// Invoke every listener in registration order.
    ///
    /// A panicking listener is contained and logged; the remaining listeners
    /// still run. Returns the number of listeners that failed.
    pub(crate) fn dispatch(&self, notification: &CacheNotification) -> usize {
        let snapshot: Vec<(u64, Listener)> = mutex_lock(&self.slots, SOURCE, "dispatch")
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        let mut failures = 0;
        for (id, listener) in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(notification))) {
                failures += 1;
                counter!(METRIC_LISTENER_FAILURES).increment(1);
                warn!(
                    listener_id = id,
                    cache_key = %notification.key,
                    panic = %panic_message(payload.as_ref()),
                    "Cache listener failed; continuing with remaining listeners"
                );
            }
        }
        failures
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle returned by [`CacheStore::subscribe`](super::CacheStore::subscribe).
///
/// Removes exactly its own registration. Unsubscribing is idempotent and also
/// happens when the handle is dropped.
#[must_use = "dropping a subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerSet>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove the registration. Returns `true` only for the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        match self.listeners.upgrade() {
            Some(listeners) => listeners.remove(self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
