use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global tracing subscriber. `RUST_LOG` overrides the configured level.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pulsecache_cache_hit_total",
            Unit::Count,
            "Cache hits, labelled by freshness (fresh or stale)."
        );
        describe_counter!(
            "pulsecache_cache_miss_total",
            Unit::Count,
            "Lookups that had to wait on a fetch, including forced refreshes."
        );
        describe_counter!(
            "pulsecache_fetch_coalesced_total",
            Unit::Count,
            "Callers that joined a fetch already in flight."
        );
        describe_counter!(
            "pulsecache_fetch_failure_total",
            Unit::Count,
            "Failed upstream fetches, labelled by origin."
        );
        describe_histogram!(
            "pulsecache_fetch_ms",
            Unit::Milliseconds,
            "Upstream fetch latency in milliseconds."
        );
        describe_counter!(
            "pulsecache_listener_failure_total",
            Unit::Count,
            "Cache listeners that panicked during dispatch."
        );
        describe_gauge!(
            "pulsecache_live_sessions",
            Unit::Count,
            "Currently open live update sessions."
        );
        describe_counter!(
            "pulsecache_live_sessions_closed_total",
            Unit::Count,
            "Closed live update sessions, labelled by reason."
        );
        describe_counter!(
            "pulsecache_live_events_total",
            Unit::Count,
            "Events written to live sessions, labelled by type."
        );
    });
}
