//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{fmt, net::SocketAddr, num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pulsecache";
const ENV_PREFIX: &str = "PULSECACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_TTL_SECS: u64 = crate::cache::DEFAULT_TTL_SECS;
const DEFAULT_CACHE_STALE_TTL_SECS: u64 = crate::cache::DEFAULT_STALE_TTL_SECS;
const DEFAULT_LIVE_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_LIVE_SESSION_LIFETIME_SECS: u64 = 290;
const DEFAULT_LIVE_PLATFORM_LIMIT_SECS: u64 = 300;
const DEFAULT_LIVE_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_UPSTREAM_BASE_URL: &str = "http://127.0.0.1:8080/";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 15;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub live: LiveSettings,
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub stale_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub heartbeat_interval: Duration,
    pub session_lifetime: Duration,
    /// Hard limit the hosting platform puts on a single connection.
    pub platform_connection_limit: Duration,
    pub channel_capacity: NonZeroUsize,
}

#[derive(Clone)]
pub struct UpstreamSettings {
    pub base_url: Url,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
}

impl fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("base_url", &self.base_url.as_str())
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    match cli.command.as_ref() {
        Some(command) => raw.apply_serve_overrides(command.overrides()),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    live: RawLiveSettings,
    upstream: RawUpstreamSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(seconds) = overrides.cache_ttl_seconds {
            self.cache.ttl_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.cache_stale_ttl_seconds {
            self.cache.stale_ttl_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.live_heartbeat_seconds {
            self.live.heartbeat_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.live_session_lifetime_seconds {
            self.live.session_lifetime_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.live_platform_limit_seconds {
            self.live.platform_connection_limit_seconds = Some(seconds);
        }
        if let Some(url) = overrides.upstream_base_url.as_ref() {
            self.upstream.base_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.upstream_timeout_seconds {
            self.upstream.request_timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            live,
            upstream,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            live: build_live_settings(live)?,
            upstream: build_upstream_settings(upstream)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_shutdown = positive_secs(
        server.graceful_shutdown_seconds,
        DEFAULT_GRACEFUL_SHUTDOWN_SECS,
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let ttl = positive_secs(cache.ttl_seconds, DEFAULT_CACHE_TTL_SECS, "cache.ttl_seconds")?;
    let stale_ttl = positive_secs(
        cache.stale_ttl_seconds,
        DEFAULT_CACHE_STALE_TTL_SECS,
        "cache.stale_ttl_seconds",
    )?;
    if stale_ttl <= ttl {
        return Err(LoadError::invalid(
            "cache.stale_ttl_seconds",
            format!(
                "must exceed cache.ttl_seconds ({}s), got {}s",
                ttl.as_secs(),
                stale_ttl.as_secs()
            ),
        ));
    }
    Ok(CacheSettings { ttl, stale_ttl })
}

fn build_live_settings(live: RawLiveSettings) -> Result<LiveSettings, LoadError> {
    let heartbeat_interval = positive_secs(
        live.heartbeat_seconds,
        DEFAULT_LIVE_HEARTBEAT_SECS,
        "live.heartbeat_seconds",
    )?;
    let session_lifetime = positive_secs(
        live.session_lifetime_seconds,
        DEFAULT_LIVE_SESSION_LIFETIME_SECS,
        "live.session_lifetime_seconds",
    )?;
    let platform_connection_limit = positive_secs(
        live.platform_connection_limit_seconds,
        DEFAULT_LIVE_PLATFORM_LIMIT_SECS,
        "live.platform_connection_limit_seconds",
    )?;

    if heartbeat_interval >= session_lifetime {
        return Err(LoadError::invalid(
            "live.heartbeat_seconds",
            "must be shorter than live.session_lifetime_seconds",
        ));
    }
    if session_lifetime >= platform_connection_limit {
        return Err(LoadError::invalid(
            "live.session_lifetime_seconds",
            "must be shorter than live.platform_connection_limit_seconds",
        ));
    }

    let channel_capacity = NonZeroUsize::new(
        live.channel_capacity
            .unwrap_or(DEFAULT_LIVE_CHANNEL_CAPACITY),
    )
    .ok_or_else(|| LoadError::invalid("live.channel_capacity", "must be greater than zero"))?;

    Ok(LiveSettings {
        heartbeat_interval,
        session_lifetime,
        platform_connection_limit,
        channel_capacity,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let raw_url = upstream
        .base_url
        .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string());
    let base_url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("upstream.base_url", format!("`{raw_url}`: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "upstream.base_url",
            format!("unsupported scheme `{}`", base_url.scheme()),
        ));
    }

    let api_token = upstream.api_token.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let request_timeout = positive_secs(
        upstream.request_timeout_seconds,
        DEFAULT_UPSTREAM_TIMEOUT_SECS,
        "upstream.request_timeout_seconds",
    )?;

    Ok(UpstreamSettings {
        base_url,
        api_token,
        request_timeout,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    ttl_seconds: Option<u64>,
    stale_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLiveSettings {
    heartbeat_seconds: Option<u64>,
    session_lifetime_seconds: Option<u64>,
    platform_connection_limit_seconds: Option<u64>,
    channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    base_url: Option<String>,
    api_token: Option<String>,
    request_timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn positive_secs(value: Option<u64>, default: u64, key: &'static str) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

#[cfg(test)]
mod tests;
