//! Stored entries and the shapes handed back to readers.

use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;

/// A single cached value. Replaced wholesale on every successful write.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<V> {
    pub(crate) data: V,
    /// Monotonic write instant used for freshness decisions.
    pub(crate) written_at: Instant,
    /// Wall-clock write time reported to readers and listeners.
    pub(crate) updated_at: OffsetDateTime,
}

impl<V: Clone> CacheEntry<V> {
    pub(crate) fn new(data: V, updated_at: OffsetDateTime) -> Self {
        Self {
            data,
            written_at: Instant::now(),
            updated_at,
        }
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.written_at)
    }

    pub(crate) fn hit(&self, age: Duration) -> Hit<V> {
        Hit {
            data: self.data.clone(),
            age,
            last_updated: self.updated_at,
        }
    }
}

/// Data found by a probe together with how old it is.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit<V> {
    pub data: V,
    pub age: Duration,
    pub last_updated: OffsetDateTime,
}

/// Outcome of [`CacheStore::get`](super::CacheStore::get).
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    Miss,
    Fresh(Hit<V>),
    Stale(Hit<V>),
}

impl<V> Lookup<V> {
    pub fn is_miss(&self) -> bool {
        matches!(self, Lookup::Miss)
    }

    pub fn into_hit(self) -> Option<Hit<V>> {
        match self {
            Lookup::Miss => None,
            Lookup::Fresh(hit) | Lookup::Stale(hit) => Some(hit),
        }
    }
}

/// Result of [`CacheStore::get_or_fetch`](super::CacheStore::get_or_fetch).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedValue<V> {
    pub data: V,
    /// Served from the store without waiting on the upstream.
    pub cached: bool,
    /// Served past its TTL; a background refresh has been requested.
    pub stale: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl<V> CachedValue<V> {
    pub(crate) fn from_hit(hit: Hit<V>, stale: bool) -> Self {
        Self {
            data: hit.data,
            cached: true,
            stale,
            last_updated: hit.last_updated,
        }
    }

    pub(crate) fn fetched(data: V, last_updated: OffsetDateTime) -> Self {
        Self {
            data,
            cached: false,
            stale: false,
            last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn cached_value_serializes_camel_case() {
        let value = CachedValue {
            data: json!({ "total": 5 }),
            cached: true,
            stale: false,
            last_updated: datetime!(2024-03-01 12:00:00 UTC),
        };

        let encoded = serde_json::to_value(&value).expect("serializable");
        assert_eq!(
            encoded,
            json!({
                "data": { "total": 5 },
                "cached": true,
                "stale": false,
                "lastUpdated": "2024-03-01T12:00:00Z",
            })
        );
    }

    #[test]
    fn lookup_helpers() {
        let hit = Hit {
            data: 1_u8,
            age: Duration::from_secs(2),
            last_updated: OffsetDateTime::UNIX_EPOCH,
        };
        assert!(Lookup::<u8>::Miss.is_miss());
        assert!(Lookup::<u8>::Miss.into_hit().is_none());
        assert_eq!(Lookup::Stale(hit.clone()).into_hit(), Some(hit));
    }
}
