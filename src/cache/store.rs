//! The process-wide cache store.
//!
//! One [`CacheStore`] is constructed at process start and its handle is cloned
//! into every consumer; clones share the same maps. Entries expire by age only,
//! there is no capacity-based eviction.

use std::collections::{HashMap, VecDeque};
use std::error::Error as StdError;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use metrics::{counter, histogram};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::{CacheConfig, Freshness};
use super::entry::{CacheEntry, CachedValue, Lookup};
use super::fetch::{FetchError, FetchOrigin, PendingFetch};
use super::listeners::{CacheNotification, Listener, ListenerSet, Subscription, panic_message};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

const METRIC_HIT_TOTAL: &str = "pulsecache_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "pulsecache_cache_miss_total";
const METRIC_COALESCED_TOTAL: &str = "pulsecache_fetch_coalesced_total";
const METRIC_FETCH_FAILURE_TOTAL: &str = "pulsecache_fetch_failure_total";
const METRIC_FETCH_MS: &str = "pulsecache_fetch_ms";

/// Keyed in-memory store with TTL freshness, a stale window, per-key fetch
/// coalescing and change notifications.
pub struct CacheStore<V> {
    inner: Arc<StoreInner<V>>,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct StoreInner<V> {
    config: CacheConfig,
    /// Entries, the in-flight registry and the notification outbox share one
    /// lock so that probing, registering and settling a fetch are each a single
    /// critical section, and notifications queue up in write order.
    state: Mutex<StoreState<V>>,
    listeners: Arc<ListenerSet>,
    next_fetch_id: AtomicU64,
}

struct StoreState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V>>,
    outbox: VecDeque<CacheNotification>,
    /// Set while some caller is delivering the outbox. Listeners always run
    /// with no store lock held.
    draining: bool,
}

struct InFlight<V> {
    id: u64,
    pending: PendingFetch<V>,
}

/// What a `get_or_fetch` call decided under the state lock.
enum Plan<V> {
    Cached(CachedValue<V>),
    Await(PendingFetch<V>),
}

/// Snapshot returned by [`CacheStore::stats`]. For debugging only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub fresh: usize,
    pub stale: usize,
    /// Expired but not yet evicted (eviction happens on the next read).
    pub expired: usize,
    pub in_flight: usize,
    pub listeners: usize,
    /// Heuristic payload size, when a sizer was supplied.
    pub approximate_bytes: Option<usize>,
    pub keys: Vec<String>,
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                state: Mutex::new(StoreState {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                    outbox: VecDeque::new(),
                    draining: false,
                }),
                listeners: Arc::new(ListenerSet::new()),
                next_fetch_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Probe `key` without fetching. Expired entries are evicted here.
    pub fn get(&self, key: &str) -> Lookup<V> {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "get");
        self.probe(&mut state, key)
    }

    /// Overwrite `key` and notify listeners. Returns the write timestamp.
    ///
    /// Listeners have run by the time this returns, unless it was called from
    /// inside a listener or while another caller is delivering notifications;
    /// that caller then delivers this one next, in write order.
    pub fn set(&self, key: &str, data: V) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "set");
            state
                .entries
                .insert(key.to_string(), CacheEntry::new(data, now));
            Self::enqueue(&mut state, key, now);
        }
        self.deliver();
        now
    }

    /// Serve `key` from the store when possible, otherwise fetch it once no
    /// matter how many callers ask concurrently.
    ///
    /// A stale hit is returned immediately and schedules a background refresh
    /// unless a fetch for the key is already running. `force_refresh` skips the
    /// probe but still joins an in-flight fetch.
    ///
    /// Dropping the returned future does not cancel the fetch; other callers
    /// and later reads still receive its result.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        force_refresh: bool,
    ) -> Result<CachedValue<V>, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        let plan = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "get_or_fetch");
            self.plan(&mut state, key, fetcher, force_refresh)
        };

        match plan {
            Plan::Cached(value) => Ok(value),
            Plan::Await(pending) => {
                let (data, last_updated) = pending.await?;
                Ok(CachedValue::fetched(data, last_updated))
            }
        }
    }

    /// Remove `key` and notify listeners, whether or not anything was cached.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "invalidate");
            let removed = state.entries.remove(key).is_some();
            Self::enqueue(&mut state, key, OffsetDateTime::now_utc());
            removed
        };
        debug!(cache_key = %key, removed, "Cache key invalidated");
        self.deliver();
        removed
    }

    /// Invalidate every cached key starting with `prefix`. Returns the removed
    /// keys in sorted order, which is also the notification order.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> Vec<String> {
        let removed: Vec<String> = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "invalidate_by_prefix");
            let mut matching: Vec<String> = state
                .entries
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect();
            matching.sort();
            let now = OffsetDateTime::now_utc();
            for key in &matching {
                state.entries.remove(key);
                Self::enqueue(&mut state, key, now);
            }
            matching
        };

        debug!(prefix, removed = removed.len(), "Cache prefix invalidated");
        self.deliver();
        removed
    }

    /// Register a listener for writes and invalidations.
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        self.inner.listeners.register(listener)
    }

    /// Drop every entry without notifying. In-flight fetches keep running and
    /// will repopulate their keys.
    pub fn clear(&self) -> usize {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "clear");
        let dropped = state.entries.len();
        state.entries.clear();
        debug!(dropped, "Cache cleared");
        dropped
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        mutex_lock(&self.inner.state, SOURCE, "is_in_flight")
            .in_flight
            .contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "in_flight_count")
            .in_flight
            .len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.collect_stats(None::<fn(&str, &V) -> usize>)
    }

    /// Like [`stats`](Self::stats), with a heuristic size for each entry.
    pub fn stats_with<S>(&self, sizer: S) -> CacheStats
    where
        S: Fn(&str, &V) -> usize,
    {
        self.collect_stats(Some(sizer))
    }

    fn collect_stats<S>(&self, sizer: Option<S>) -> CacheStats
    where
        S: Fn(&str, &V) -> usize,
    {
        let state = mutex_lock(&self.inner.state, SOURCE, "stats");
        let now = Instant::now();
        let mut stats = CacheStats {
            entries: state.entries.len(),
            in_flight: state.in_flight.len(),
            listeners: self.inner.listeners.len(),
            approximate_bytes: sizer.as_ref().map(|_| 0),
            ..CacheStats::default()
        };

        for (key, entry) in &state.entries {
            match self.inner.config.classify(entry.age(now)) {
                Freshness::Fresh => stats.fresh += 1,
                Freshness::Stale => stats.stale += 1,
                Freshness::Expired => stats.expired += 1,
            }
            if let (Some(total), Some(sizer)) = (stats.approximate_bytes.as_mut(), sizer.as_ref()) {
                *total += sizer(key, &entry.data);
            }
            stats.keys.push(key.clone());
        }
        stats.keys.sort();
        stats
    }

    fn probe(&self, state: &mut StoreState<V>, key: &str) -> Lookup<V> {
        let Some(entry) = state.entries.get(key) else {
            return Lookup::Miss;
        };

        let age = entry.age(Instant::now());
        match self.inner.config.classify(age) {
            Freshness::Fresh => Lookup::Fresh(entry.hit(age)),
            Freshness::Stale => Lookup::Stale(entry.hit(age)),
            Freshness::Expired => {
                state.entries.remove(key);
                debug!(cache_key = %key, age_ms = age.as_millis() as u64, "Evicted expired entry");
                Lookup::Miss
            }
        }
    }

    fn plan<F, Fut, E>(
        &self,
        state: &mut StoreState<V>,
        key: &str,
        fetcher: F,
        force_refresh: bool,
    ) -> Plan<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        if !force_refresh {
            match self.probe(state, key) {
                Lookup::Fresh(hit) => {
                    counter!(METRIC_HIT_TOTAL, "freshness" => "fresh").increment(1);
                    debug!(cache_key = %key, outcome = "fresh", "Cache hit");
                    return Plan::Cached(CachedValue::from_hit(hit, false));
                }
                Lookup::Stale(hit) => {
                    counter!(METRIC_HIT_TOTAL, "freshness" => "stale").increment(1);
                    if state.in_flight.contains_key(key) {
                        debug!(cache_key = %key, outcome = "stale", "Cache hit; refresh already running");
                    } else {
                        debug!(cache_key = %key, outcome = "stale", "Cache hit; scheduling background refresh");
                        // The pending handle is dropped: the spawned task settles on its own.
                        let _ = self.launch(state, key, fetcher, FetchOrigin::Background);
                    }
                    return Plan::Cached(CachedValue::from_hit(hit, true));
                }
                Lookup::Miss => {}
            }
        }

        counter!(METRIC_MISS_TOTAL, "forced" => if force_refresh { "true" } else { "false" })
            .increment(1);

        if let Some(in_flight) = state.in_flight.get(key) {
            counter!(METRIC_COALESCED_TOTAL).increment(1);
            debug!(cache_key = %key, fetch_id = in_flight.id, "Joining in-flight fetch");
            return Plan::Await(in_flight.pending.clone());
        }

        Plan::Await(self.launch(state, key, fetcher, FetchOrigin::Foreground))
    }

    /// Start a fetch and register it. Must be called with the state lock held
    /// and no in-flight entry for `key`.
    fn launch<F, Fut, E>(
        &self,
        state: &mut StoreState<V>,
        key: &str,
        fetcher: F,
        origin: FetchOrigin,
    ) -> PendingFetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::SeqCst);
        debug!(cache_key = %key, fetch_id = id, origin = origin.as_str(), "Starting upstream fetch");

        let store = self.clone();
        let task_key = key.to_string();
        let handle = tokio::spawn(async move {
            let started_at = Instant::now();
            let outcome = match AssertUnwindSafe(async move { fetcher().await })
                .catch_unwind()
                .await
            {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(err)) => Err(FetchError::upstream(&task_key, err)),
                Err(payload) => Err(FetchError::Panicked {
                    key: task_key.clone(),
                    message: panic_message(payload.as_ref()),
                }),
            };
            histogram!(
                METRIC_FETCH_MS,
                "origin" => origin.as_str(),
                "outcome" => if outcome.is_ok() { "ok" } else { "error" }
            )
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
            store.settle(&task_key, id, origin, outcome)
        });

        let store = self.clone();
        let join_key = key.to_string();
        let pending: PendingFetch<V> = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => {
                    // The task never reached `settle`; release the slot ourselves.
                    warn!(cache_key = %join_key, fetch_id = id, error = %err, "Fetch task aborted");
                    store.release(&join_key, id);
                    Err(FetchError::Cancelled { key: join_key })
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                pending: pending.clone(),
            },
        );
        pending
    }

    /// Record a finished fetch: write on success, then release the slot, all
    /// before any awaiting caller can observe the outcome.
    fn settle(
        &self,
        key: &str,
        id: u64,
        origin: FetchOrigin,
        outcome: Result<V, FetchError>,
    ) -> Result<(V, OffsetDateTime), FetchError> {
        match outcome {
            Ok(data) => {
                let now = OffsetDateTime::now_utc();
                {
                    let mut state = mutex_lock(&self.inner.state, SOURCE, "settle");
                    state
                        .entries
                        .insert(key.to_string(), CacheEntry::new(data.clone(), now));
                    Self::remove_in_flight(&mut state, key, id);
                    Self::enqueue(&mut state, key, now);
                }
                debug!(cache_key = %key, fetch_id = id, origin = origin.as_str(), "Fetch stored");
                self.deliver();
                Ok((data, now))
            }
            Err(err) => {
                self.release(key, id);
                counter!(METRIC_FETCH_FAILURE_TOTAL, "origin" => origin.as_str()).increment(1);
                match origin {
                    FetchOrigin::Background => warn!(
                        cache_key = %key,
                        fetch_id = id,
                        error = %err,
                        "Background refresh failed; keeping stale value"
                    ),
                    FetchOrigin::Foreground => debug!(
                        cache_key = %key,
                        fetch_id = id,
                        error = %err,
                        "Fetch failed"
                    ),
                }
                Err(err)
            }
        }
    }

    fn release(&self, key: &str, id: u64) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "release");
        Self::remove_in_flight(&mut state, key, id);
    }

    fn remove_in_flight(state: &mut StoreState<V>, key: &str, id: u64) {
        if state.in_flight.get(key).is_some_and(|in_flight| in_flight.id == id) {
            state.in_flight.remove(key);
        }
    }

    fn enqueue(state: &mut StoreState<V>, key: &str, timestamp: OffsetDateTime) {
        state.outbox.push_back(CacheNotification {
            key: key.to_string(),
            timestamp,
        });
    }

    /// Run listeners for everything queued, one notification at a time and
    /// with no store lock held. Only one caller drains at once; a write made
    /// from inside a listener is picked up by the loop that is already running.
    fn deliver(&self) {
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "deliver");
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let next = {
                let mut state = mutex_lock(&self.inner.state, SOURCE, "deliver");
                match state.outbox.pop_front() {
                    Some(notification) => notification,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            self.inner.listeners.dispatch(&next);
        }
    }
}

impl CacheStore<serde_json::Value> {
    /// Stats with a serialized-length size estimate for JSON payloads.
    pub fn json_stats(&self) -> CacheStats {
        self.stats_with(|key, value| key.len() + serde_json::to_vec(value).map_or(0, |b| b.len()))
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    fn store() -> CacheStore<u32> {
        CacheStore::new(CacheConfig::new(
            Duration::from_secs(10),
            Duration::from_secs(30),
        ))
    }

    async fn run_pending() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn exploding_fetcher() -> futures::future::Ready<Result<u32, io::Error>> {
        panic!("upstream client bug");
    }

    #[tokio::test(start_paused = true)]
    async fn get_classifies_and_evicts() {
        let store = store();
        assert!(store.get("k").is_miss());

        store.set("k", 1);
        assert!(matches!(store.get("k"), Lookup::Fresh(hit) if hit.data == 1));

        tokio::time::advance(Duration::from_secs(10)).await;
        match store.get("k") {
            Lookup::Stale(hit) => assert_eq!(hit.age, Duration::from_secs(10)),
            other => panic!("expected stale hit, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(store.get("k").is_miss());
        assert_eq!(store.len(), 0, "expired entry evicted by the probe");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_releases_slot_and_writes_nothing() {
        let store = store();

        let err = store
            .get_or_fetch("k", || async { Err::<u32, _>(io::Error::other("503")) }, false)
            .await
            .expect_err("fetch fails");

        assert_eq!(err.key(), "k");
        assert!(matches!(err, FetchError::Upstream { .. }));
        assert!(!store.is_in_flight("k"));
        assert!(store.get("k").is_miss());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_fetcher_becomes_fetch_error() {
        let store = store();

        let err = store
            .get_or_fetch("k", exploding_fetcher, false)
            .await
            .expect_err("fetch panics");

        match err {
            FetchError::Panicked { key, message } => {
                assert_eq!(key, "k");
                assert_eq!(message, "upstream client bug");
            }
            other => panic!("expected panic error, got {other:?}"),
        }
        assert_eq!(store.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_does_not_cancel_fetch() {
        let store = store();
        let (tx, rx) = oneshot::channel::<u32>();

        let caller = tokio::spawn({
            let store = store.clone();
            async move { store.get_or_fetch("k", move || rx, false).await }
        });
        run_pending().await;
        assert!(store.is_in_flight("k"));

        caller.abort();
        assert!(caller.await.is_err());
        assert!(store.is_in_flight("k"), "fetch outlives its caller");

        tx.send(7).expect("fetch still listening");
        run_pending().await;

        assert!(!store.is_in_flight("k"));
        assert!(matches!(store.get("k"), Lookup::Fresh(hit) if hit.data == 7));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_keeps_in_flight_fetches_and_skips_notifications() {
        let store = store();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let _sub = store.subscribe({
            let seen = Arc::clone(&seen);
            Arc::new(move |n: &CacheNotification| seen.lock().expect("seen").push(n.key.clone()))
        });

        store.set("a", 1);
        let (tx, rx) = oneshot::channel::<u32>();
        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.get_or_fetch("b", move || rx, false).await }
        });
        run_pending().await;

        assert_eq!(store.clear(), 1);
        assert!(store.is_empty());
        assert!(store.is_in_flight("b"));

        tx.send(2).expect("fetch listening");
        let value = pending.await.expect("join").expect("fetch ok");
        assert_eq!(value.data, 2);
        assert!(!value.cached);

        assert_eq!(store.len(), 1);
        assert_eq!(*seen.lock().expect("seen"), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_hit_with_refresh_running_does_not_launch_another() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        store.set("k", 1);
        tokio::time::advance(Duration::from_secs(15)).await;

        let (tx, rx) = oneshot::channel::<u32>();
        let first = store
            .get_or_fetch(
                "k",
                {
                    let calls = Arc::clone(&calls);
                    move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        rx
                    }
                },
                false,
            )
            .await
            .expect("stale value");
        assert!(first.stale && first.cached);
        run_pending().await;
        assert!(store.is_in_flight("k"));

        let second = store
            .get_or_fetch(
                "k",
                {
                    let calls = Arc::clone(&calls);
                    move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<_, io::Error>(99) }
                    }
                },
                false,
            )
            .await
            .expect("stale value");
        assert_eq!(second.data, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tx.send(2).expect("refresh listening");
        run_pending().await;
        assert!(matches!(store.get("k"), Lookup::Fresh(hit) if hit.data == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_background_refresh_keeps_stale_value() {
        let store = store();
        store.set("k", 1);
        tokio::time::advance(Duration::from_secs(12)).await;

        let value = store
            .get_or_fetch("k", || async { Err::<u32, _>(io::Error::other("429")) }, false)
            .await
            .expect("stale value served");
        assert!(value.stale);
        run_pending().await;

        assert!(!store.is_in_flight("k"));
        assert!(matches!(store.get("k"), Lookup::Stale(hit) if hit.data == 1));
    }

    #[tokio::test]
    async fn listener_can_invalidate_another_key() {
        let store = store();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let cascade = store.subscribe({
            let store = store.clone();
            Arc::new(move |n: &CacheNotification| {
                if n.key == "projects:all" {
                    store.invalidate("stats");
                }
            })
        });
        let _log = store.subscribe({
            let seen = Arc::clone(&seen);
            Arc::new(move |n: &CacheNotification| seen.lock().expect("seen").push(n.key.clone()))
        });

        store.set("stats", 5);
        store.set("projects:all", 1);

        assert!(store.get("stats").is_miss());
        assert!(matches!(store.get("projects:all"), Lookup::Fresh(hit) if hit.data == 1));
        assert_eq!(
            *seen.lock().expect("seen"),
            vec!["stats", "projects:all", "stats"]
        );
        assert!(cascade.unsubscribe());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reports_freshness_buckets() {
        let store = store();
        store.set("projects:all", 1);
        store.set("deals:sales", 2);
        tokio::time::advance(Duration::from_secs(12)).await;
        store.set("deals:dnr", 3);

        let stats = store.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.fresh, 1);
        assert_eq!(stats.stale, 2);
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.approximate_bytes, None);
        assert_eq!(stats.keys, vec!["deals:dnr", "deals:sales", "projects:all"]);

        let sized = store.stats_with(|key, _| key.len());
        assert_eq!(sized.approximate_bytes, Some(9 + 11 + 12));
    }
}
