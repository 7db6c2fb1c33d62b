//! One live update session per connected dashboard.
//!
//! A session subscribes to the store, forwards every notification as a
//! `cache_update` event, emits heartbeats while idle and closes itself after a
//! bounded lifetime. Teardown runs exactly once whichever way the session ends.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, gauge};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheNotification, CacheStore, Subscription};

use super::config::LiveConfig;
use super::events::{LIFETIME_REACHED, LiveEvent};

const METRIC_SESSIONS_OPEN: &str = "pulsecache_live_sessions";
const METRIC_SESSIONS_CLOSED: &str = "pulsecache_live_sessions_closed_total";
const METRIC_EVENTS_SENT: &str = "pulsecache_live_events_total";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("client disconnected")]
    Disconnected,
    #[error("failed to encode live event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Transport a session writes its events to.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&mut self, event: LiveEvent) -> Result<(), SinkError>;

    /// Resolves once the peer has gone away. Sinks that cannot tell never resolve.
    async fn closed(&self) {
        futures::future::pending::<()>().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Active,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    LifetimeReached,
    ClientDisconnected,
    WriteFailed,
    /// The store stopped delivering notifications.
    SourceClosed,
    /// Dropped without an explicit close (task aborted, server shutdown).
    Cancelled,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::LifetimeReached => "lifetime_reached",
            CloseReason::ClientDisconnected => "client_disconnected",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::SourceClosed => "source_closed",
            CloseReason::Cancelled => "cancelled",
        }
    }

    fn from_sink_error(err: &SinkError) -> Self {
        match err {
            SinkError::Disconnected => CloseReason::ClientDisconnected,
            SinkError::Encode(_) => CloseReason::WriteFailed,
        }
    }
}

/// How a write ended when it was not refused by the sink.
enum Sent {
    Delivered,
    /// The lifetime ran out while the sink was still waiting for room.
    Expired,
}

enum Step {
    Update(CacheNotification),
    Heartbeat,
    Expired,
    Disconnected,
    SourceClosed,
}

pub struct LiveSession<S> {
    id: Uuid,
    sink: S,
    config: LiveConfig,
    state: SessionState,
    opened_at: Instant,
    subscription: Option<Subscription>,
    updates: Option<mpsc::UnboundedReceiver<CacheNotification>>,
    heartbeat: Option<Interval>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> LiveSession<S> {
    pub fn new(id: Uuid, sink: S, config: LiveConfig) -> Self {
        gauge!(METRIC_SESSIONS_OPEN).increment(1.0);
        Self {
            id,
            sink,
            config,
            state: SessionState::Starting,
            opened_at: Instant::now(),
            subscription: None,
            updates: None,
            heartbeat: None,
            deadline: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Tear the session down: stop both timers and release the subscription.
    ///
    /// Only the first call does anything and returns `true`; every later call
    /// from any other exit path is a no-op.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return false;
        }
        self.state = SessionState::Closing;

        self.heartbeat = None;
        self.deadline = None;
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.updates = None;

        self.state = SessionState::Closed;
        gauge!(METRIC_SESSIONS_OPEN).decrement(1.0);
        counter!(METRIC_SESSIONS_CLOSED, "reason" => reason.as_str()).increment(1);
        info!(
            session_id = %self.id,
            reason = reason.as_str(),
            duration_ms = self.opened_at.elapsed().as_millis() as u64,
            "Live session closed"
        );
        true
    }
}

impl<S: EventSink> LiveSession<S> {
    /// Send `connected`, subscribe to `store` and arm the timers.
    ///
    /// On failure the session is already closed when this returns.
    pub async fn start<V>(&mut self, store: &CacheStore<V>) -> Result<(), SinkError>
    where
        V: Clone + Send + Sync + 'static,
    {
        if self.state != SessionState::Starting {
            return Ok(());
        }

        if let Err(err) = self
            .emit(LiveEvent::connected(self.id, OffsetDateTime::now_utc()))
            .await
        {
            warn!(session_id = %self.id, error = %err, "Failed to open live session");
            self.close(CloseReason::from_sink_error(&err));
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscription = Some(store.subscribe(Arc::new(move |notification: &CacheNotification| {
            // A send error only means the session is already closing.
            let _ = tx.send(notification.clone());
        })));
        self.updates = Some(rx);

        let now = Instant::now();
        let mut heartbeat = interval_at(
            now + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
        self.deadline = Some(Box::pin(sleep(self.config.session_lifetime)));

        self.state = SessionState::Active;
        info!(
            session_id = %self.id,
            heartbeat_ms = self.config.heartbeat_interval.as_millis() as u64,
            lifetime_ms = self.config.session_lifetime.as_millis() as u64,
            "Live session opened"
        );
        Ok(())
    }

    /// Drive the session until it closes and report why.
    pub async fn run<V>(mut self, store: &CacheStore<V>) -> CloseReason
    where
        V: Clone + Send + Sync + 'static,
    {
        if let Err(err) = self.start(store).await {
            return CloseReason::from_sink_error(&err);
        }

        loop {
            let sent = match self.next_step().await {
                Step::Update(notification) => self.emit(LiveEvent::from(&notification)).await,
                Step::Heartbeat => {
                    self.emit(LiveEvent::heartbeat(OffsetDateTime::now_utc()))
                        .await
                }
                Step::Expired => Ok(Sent::Expired),
                Step::Disconnected => {
                    self.close(CloseReason::ClientDisconnected);
                    return CloseReason::ClientDisconnected;
                }
                Step::SourceClosed => {
                    self.close(CloseReason::SourceClosed);
                    return CloseReason::SourceClosed;
                }
            };
            let reason = match sent {
                Ok(Sent::Delivered) => continue,
                Ok(Sent::Expired) => self.expire(),
                Err(err) => self.write_failed(&err),
            };
            self.close(reason);
            return reason;
        }
    }

    async fn next_step(&mut self) -> Step {
        let (Some(updates), Some(heartbeat), Some(deadline)) = (
            self.updates.as_mut(),
            self.heartbeat.as_mut(),
            self.deadline.as_mut(),
        ) else {
            return Step::SourceClosed;
        };

        tokio::select! {
            biased;
            () = deadline.as_mut() => Step::Expired,
            () = self.sink.closed() => Step::Disconnected,
            update = updates.recv() => match update {
                Some(notification) => Step::Update(notification),
                None => Step::SourceClosed,
            },
            _ = heartbeat.tick() => Step::Heartbeat,
        }
    }

    /// Write one event. Once the session is active the write races the
    /// lifetime timer, so a client that stops reading cannot hold it open.
    async fn emit(&mut self, event: LiveEvent) -> Result<Sent, SinkError> {
        let kind = event.kind();
        match self.deadline.as_mut() {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = deadline.as_mut() => return Ok(Sent::Expired),
                    sent = self.sink.send(event) => sent?,
                }
            }
            None => self.sink.send(event).await?,
        }
        counter!(METRIC_EVENTS_SENT, "type" => kind).increment(1);
        Ok(Sent::Delivered)
    }

    /// Leave a reconnect notice if the sink takes it without waiting; a
    /// client that is not reading would never see it anyway.
    fn expire(&mut self) -> CloseReason {
        match self
            .sink
            .send(LiveEvent::reconnect(LIFETIME_REACHED))
            .now_or_never()
        {
            Some(Ok(())) => counter!(METRIC_EVENTS_SENT, "type" => "reconnect").increment(1),
            Some(Err(err)) => {
                debug!(session_id = %self.id, error = %err, "Reconnect notice not delivered");
            }
            None => debug!(session_id = %self.id, "Reconnect notice dropped; client is not reading"),
        }
        CloseReason::LifetimeReached
    }

    fn write_failed(&self, err: &SinkError) -> CloseReason {
        debug!(session_id = %self.id, error = %err, "Live session write failed");
        CloseReason::from_sink_error(err)
    }
}

impl<S> Drop for LiveSession<S> {
    fn drop(&mut self) {
        self.close(CloseReason::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::cache::CacheConfig;

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<StdMutex<Vec<LiveEvent>>>,
        fail_after: Option<usize>,
    }

    impl RecordingSink {
        fn kinds(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .expect("events")
                .iter()
                .map(LiveEvent::kind)
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&mut self, event: LiveEvent) -> Result<(), SinkError> {
            let mut events = self.events.lock().expect("events");
            if self.fail_after.is_some_and(|limit| events.len() >= limit) {
                return Err(SinkError::Disconnected);
            }
            events.push(event);
            Ok(())
        }
    }

    /// Accepts `capacity` events, then waits forever like a full buffer nobody reads.
    #[derive(Clone)]
    struct StalledSink {
        accepted: Arc<StdMutex<Vec<&'static str>>>,
        capacity: usize,
    }

    #[async_trait]
    impl EventSink for StalledSink {
        async fn send(&mut self, event: LiveEvent) -> Result<(), SinkError> {
            if self.accepted.lock().expect("accepted").len() >= self.capacity {
                futures::future::pending::<()>().await;
            }
            self.accepted.lock().expect("accepted").push(event.kind());
            Ok(())
        }
    }

    fn config() -> LiveConfig {
        LiveConfig {
            heartbeat_interval: Duration::from_secs(30),
            session_lifetime: Duration::from_secs(290),
            channel_capacity: 8,
        }
    }

    fn store() -> CacheStore<u32> {
        CacheStore::new(CacheConfig::default())
    }

    async fn run_pending() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent() {
        let store = store();
        let mut session = LiveSession::new(Uuid::new_v4(), RecordingSink::default(), config());

        session.start(&store).await.expect("started");
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(store.listener_count(), 1);

        assert!(session.close(CloseReason::ClientDisconnected));
        assert!(!session.close(CloseReason::WriteFailed));
        assert!(!session.close(CloseReason::LifetimeReached));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(store.listener_count(), 0);

        drop(session);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_leaves_nothing_behind() {
        let store = store();
        let sink = RecordingSink {
            fail_after: Some(0),
            ..RecordingSink::default()
        };
        let mut session = LiveSession::new(Uuid::new_v4(), sink, config());

        assert!(matches!(session.start(&store).await, Err(SinkError::Disconnected)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_updates_and_heartbeats_then_asks_to_reconnect() {
        let store = store();
        let sink = RecordingSink::default();
        let session = LiveSession::new(Uuid::new_v4(), sink.clone(), config());

        let task = tokio::spawn({
            let store = store.clone();
            async move { session.run(&store).await }
        });
        run_pending().await;
        assert_eq!(store.listener_count(), 1);

        store.set("deals:sales", 1);
        run_pending().await;
        assert_eq!(sink.kinds(), vec!["connected", "cache_update"]);

        tokio::time::advance(Duration::from_secs(30)).await;
        run_pending().await;
        assert_eq!(sink.kinds().last(), Some(&"heartbeat"));

        let reason = task.await.expect("session task");
        assert_eq!(reason, CloseReason::LifetimeReached);
        assert_eq!(sink.kinds().last(), Some(&"reconnect"));
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_closes_session() {
        let store = store();
        let sink = RecordingSink {
            fail_after: Some(1),
            ..RecordingSink::default()
        };
        let session = LiveSession::new(Uuid::new_v4(), sink.clone(), config());

        let task = tokio::spawn({
            let store = store.clone();
            async move { session.run(&store).await }
        });
        run_pending().await;

        store.invalidate("projects:all");
        let reason = task.await.expect("session task");

        assert_eq!(reason, CloseReason::ClientDisconnected);
        assert_eq!(sink.kinds(), vec!["connected"]);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_client_is_closed_at_lifetime() {
        let store = store();
        let sink = StalledSink {
            accepted: Arc::default(),
            capacity: 1,
        };
        let session = LiveSession::new(Uuid::new_v4(), sink.clone(), config());

        let task = tokio::spawn({
            let store = store.clone();
            async move { session.run(&store).await }
        });
        run_pending().await;
        assert_eq!(store.listener_count(), 1);

        for value in 0..100 {
            store.set("deals:sales", value);
        }
        run_pending().await;

        tokio::time::advance(Duration::from_secs(290)).await;
        let reason = task.await.expect("session task");

        assert_eq!(reason, CloseReason::LifetimeReached);
        assert_eq!(store.listener_count(), 0);
        assert_eq!(*sink.accepted.lock().expect("accepted"), vec!["connected"]);
    }
}
