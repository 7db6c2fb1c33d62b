//! Live update channel.
//!
//! Each connected dashboard holds one [`LiveSession`] that turns cache
//! notifications into server-sent events so the page can re-request data
//! without polling.

mod config;
mod events;
mod session;
mod stream;

pub use config::LiveConfig;
pub use events::{LIFETIME_REACHED, LiveEvent};
pub use session::{CloseReason, EventSink, LiveSession, SessionState, SinkError};
pub use stream::{SseSink, open};
