//! Client for the upstream API the cache sits in front of.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::UpstreamSettings;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("upstream base URL `{0}` cannot take path segments")]
    CannotBeBase(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl UpstreamError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Source of the data cached under a key.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn fetch(&self, key: &str) -> Result<Value, UpstreamError>;
}

/// Fetches `GET {base_url}/{key}` as JSON.
#[derive(Clone, Debug)]
pub struct HttpUpstream {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpUpstream {
    pub fn new(base: Url, token: Option<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        if base.cannot_be_a_base() {
            return Err(UpstreamError::CannotBeBase(base.to_string()));
        }
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    pub fn from_settings(settings: &UpstreamSettings) -> Result<Self, UpstreamError> {
        Self::new(
            settings.base_url.clone(),
            settings.api_token.clone(),
            settings.request_timeout,
        )
    }

    pub fn user_agent() -> &'static str {
        concat!("pulsecache/", env!("CARGO_PKG_VERSION"))
    }

    /// The URL for `key`, which always occupies exactly one path segment.
    pub fn url_for(&self, key: &str) -> Result<Url, UpstreamError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| UpstreamError::CannotBeBase(self.base.to_string()))?
            .pop_if_empty()
            .push(key);
        Ok(url)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, key: &str) -> Result<Value, UpstreamError> {
        let url = self.url_for(key)?;
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(cache_key = %key, status = status.as_u16(), "Upstream rejected request");
            return Err(UpstreamError::Status { status, body });
        }
        Ok(response.json::<Value>().await?)
    }
}
