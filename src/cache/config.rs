//! Cache freshness configuration.
//!
//! Controls how long entries are served as fresh and how much longer they may
//! be served stale while a background refresh runs.

use std::time::Duration;

// Default values for cache configuration, shared with the settings loader.
pub(crate) const DEFAULT_TTL_SECS: u64 = 60;
pub(crate) const DEFAULT_STALE_TTL_SECS: u64 = 300;

/// Freshness windows for [`CacheStore`](super::CacheStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Entries younger than this are fresh.
    pub ttl: Duration,
    /// Entries younger than this (but not fresh) are served stale; older ones are expired.
    pub stale_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            stale_ttl: Duration::from_secs(DEFAULT_STALE_TTL_SECS),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            ttl: settings.ttl,
            stale_ttl: settings.stale_ttl,
        }
    }
}

impl CacheConfig {
    pub fn new(ttl: Duration, stale_ttl: Duration) -> Self {
        Self { ttl, stale_ttl }
    }

    /// Classify an entry of the given age.
    pub fn classify(&self, age: Duration) -> Freshness {
        if age < self.ttl {
            Freshness::Fresh
        } else if age < self.stale_ttl {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

/// Freshness of an entry, derived from its age. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}
