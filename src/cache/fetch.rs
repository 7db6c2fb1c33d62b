//! Fetch outcomes shared between coalesced callers.

use std::error::Error as StdError;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use time::OffsetDateTime;

/// Error produced by a fetch, handed identically to every coalesced caller.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("fetch for `{key}` failed: {source}")]
    Upstream {
        key: String,
        #[source]
        source: Arc<dyn StdError + Send + Sync + 'static>,
    },
    #[error("fetch for `{key}` panicked: {message}")]
    Panicked { key: String, message: String },
    #[error("fetch for `{key}` was cancelled before it settled")]
    Cancelled { key: String },
}

impl FetchError {
    pub(crate) fn upstream(key: &str, error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Upstream {
            key: key.to_string(),
            source: Arc::from(error.into()),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            FetchError::Upstream { key, .. }
            | FetchError::Panicked { key, .. }
            | FetchError::Cancelled { key } => key,
        }
    }

    /// The fetcher's own error, when the failure came from the fetcher.
    pub fn upstream_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            FetchError::Upstream { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Who launched a fetch. Decides how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchOrigin {
    /// A caller is awaiting the result.
    Foreground,
    /// Stale-hit refresh; nobody awaits it and failures are only logged.
    Background,
}

impl FetchOrigin {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            FetchOrigin::Foreground => "foreground",
            FetchOrigin::Background => "background",
        }
    }
}

/// The single pending operation for a key; every coalesced caller awaits a clone.
pub(crate) type PendingFetch<V> = Shared<BoxFuture<'static, Result<(V, OffsetDateTime), FetchError>>>;

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn upstream_error_keeps_source() {
        let err = FetchError::upstream("deals:sales", io::Error::other("rate limited"));

        assert_eq!(err.key(), "deals:sales");
        assert_eq!(err.to_string(), "fetch for `deals:sales` failed: rate limited");

        let source = err.upstream_error().expect("upstream source");
        assert!(source.downcast_ref::<io::Error>().is_some());
    }

    #[test]
    fn clones_share_the_same_source() {
        let err = FetchError::upstream("k", "boom");
        let cloned = err.clone();

        match (&err, &cloned) {
            (FetchError::Upstream { source: a, .. }, FetchError::Upstream { source: b, .. }) => {
                assert!(Arc::ptr_eq(a, b));
            }
            _ => panic!("expected upstream errors"),
        }
    }
}
