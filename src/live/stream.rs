//! Server-sent event transport for live sessions.

use std::convert::Infallible;

use async_stream::stream;
use async_trait::async_trait;
use axum::http::{HeaderValue, header};
use axum::response::{
    IntoResponse, Response,
    sse::{Event, Sse},
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::CacheStore;

use super::config::LiveConfig;
use super::events::LiveEvent;
use super::session::{EventSink, LiveSession, SinkError};

/// Writes events into the channel drained by an SSE response body.
pub struct SseSink {
    tx: mpsc::Sender<Event>,
}

impl SseSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for SseSink {
    async fn send(&mut self, event: LiveEvent) -> Result<(), SinkError> {
        let payload = serde_json::to_string(&event)?;
        self.tx
            .send(Event::default().data(payload))
            .await
            .map_err(|_| SinkError::Disconnected)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Open a live session on `store` and return its streaming response.
///
/// The session runs on its own task. It ends when the body is dropped by the
/// client, when a write fails, or when the session lifetime is reached.
pub fn open<V>(store: &CacheStore<V>, config: LiveConfig) -> (Uuid, Response)
where
    V: Clone + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Event>(config.channel_capacity.max(1));
    let session_id = Uuid::new_v4();
    let session = LiveSession::new(session_id, SseSink::new(tx), config);

    let store = store.clone();
    tokio::spawn(async move { session.run(&store).await });

    let body = stream! {
        while let Some(event) = rx.recv().await {
            yield Ok::<Event, Infallible>(event);
        }
    };

    let mut response = Sse::new(body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    (session_id, response)
}
