//! Live update channel timing.

use std::time::Duration;

const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_SESSION_LIFETIME_SECS: u64 = 290;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Per-session settings shared by every live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveConfig {
    /// Period of `heartbeat` events on an otherwise idle connection.
    pub heartbeat_interval: Duration,
    /// Server-side session cap. Kept below the hosting platform's connection
    /// limit so the server closes first and asks the client to reconnect.
    pub session_lifetime: Duration,
    /// Events buffered between a session and its transport.
    pub channel_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            session_lifetime: Duration::from_secs(DEFAULT_SESSION_LIFETIME_SECS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl From<&crate::config::LiveSettings> for LiveConfig {
    fn from(settings: &crate::config::LiveSettings) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval,
            session_lifetime: settings.session_lifetime,
            channel_capacity: settings.channel_capacity.get(),
        }
    }
}
