//! Wire events of the live update channel.
//!
//! Every event is one JSON object discriminated by `type`. The channel is
//! strictly server to client.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::CacheNotification;

/// Reason sent with `reconnect` when a session reaches its lifetime.
pub const LIFETIME_REACHED: &str = "session_lifetime";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LiveEvent {
    Connected {
        session_id: Uuid,
        /// Unix milliseconds.
        timestamp: i64,
    },
    CacheUpdate {
        key: String,
        /// Unix milliseconds of the write or invalidation.
        timestamp: i64,
        #[serde(with = "time::serde::rfc3339")]
        last_updated: OffsetDateTime,
    },
    Heartbeat {
        timestamp: i64,
    },
    Reconnect {
        reason: String,
    },
}

impl LiveEvent {
    pub fn connected(session_id: Uuid, now: OffsetDateTime) -> Self {
        Self::Connected {
            session_id,
            timestamp: unix_millis(now),
        }
    }

    pub fn heartbeat(now: OffsetDateTime) -> Self {
        Self::Heartbeat {
            timestamp: unix_millis(now),
        }
    }

    pub fn reconnect(reason: impl Into<String>) -> Self {
        Self::Reconnect {
            reason: reason.into(),
        }
    }

    /// Wire name of the event, as found in its `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::CacheUpdate { .. } => "cache_update",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Reconnect { .. } => "reconnect",
        }
    }
}

impl From<&CacheNotification> for LiveEvent {
    fn from(notification: &CacheNotification) -> Self {
        Self::CacheUpdate {
            key: notification.key.clone(),
            timestamp: unix_millis(notification.timestamp),
            last_updated: notification.timestamp,
        }
    }
}

fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn cache_update_wire_shape() {
        let notification = CacheNotification {
            key: "deals:sales".to_string(),
            timestamp: datetime!(2024-03-01 12:00:00 UTC),
        };

        let event = LiveEvent::from(&notification);
        assert_eq!(event.kind(), "cache_update");
        assert_eq!(
            serde_json::to_value(&event).expect("serializable"),
            json!({
                "type": "cache_update",
                "key": "deals:sales",
                "timestamp": 1_709_294_400_000_i64,
                "lastUpdated": "2024-03-01T12:00:00Z",
            })
        );
    }

    #[test]
    fn control_events_wire_shape() {
        let session_id = Uuid::nil();
        let now = datetime!(1970-01-01 00:00:01 UTC);

        assert_eq!(
            serde_json::to_value(LiveEvent::connected(session_id, now)).expect("serializable"),
            json!({
                "type": "connected",
                "sessionId": "00000000-0000-0000-0000-000000000000",
                "timestamp": 1000,
            })
        );
        assert_eq!(
            serde_json::to_value(LiveEvent::heartbeat(now)).expect("serializable"),
            json!({ "type": "heartbeat", "timestamp": 1000 })
        );
        assert_eq!(
            serde_json::to_value(LiveEvent::reconnect(LIFETIME_REACHED)).expect("serializable"),
            json!({ "type": "reconnect", "reason": "session_lifetime" })
        );
    }
}
