//! In-process data cache.
//!
//! A single [`CacheStore`] sits in front of the upstream API:
//!
//! - **Freshness**: entries younger than `ttl` are served as-is; entries up to
//!   `stale_ttl` are served immediately while a background refresh runs.
//! - **Coalescing**: concurrent requests for one key share a single upstream
//!   fetch.
//! - **Notifications**: every write and invalidation is published to listeners,
//!   which is how the live update channel learns about changes.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! ttl_seconds = 60
//! stale_ttl_seconds = 300 # must exceed ttl_seconds
//! ```

mod config;
mod entry;
mod fetch;
pub mod keys;
mod listeners;
mod lock;
mod store;

pub use config::{CacheConfig, Freshness};
pub use entry::{CachedValue, Hit, Lookup};
pub use fetch::FetchError;
pub use listeners::{CacheNotification, Listener, Subscription};
pub use store::{CacheStats, CacheStore};

pub(crate) use config::{DEFAULT_STALE_TTL_SECS, DEFAULT_TTL_SECS};
pub(crate) use lock::mutex_lock;

/// Store holding upstream JSON payloads.
pub type DataCache = CacheStore<serde_json::Value>;
