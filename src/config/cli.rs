use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the pulsecache binary.
#[derive(Debug, Parser)]
#[command(
    name = "pulsecache",
    version,
    about = "Caching proxy with live update streams for dashboard data"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "PULSECACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service.
    Serve(Box<ServeArgs>),
    /// Resolve and validate configuration, print it and exit.
    #[command(name = "check-config")]
    CheckConfig(Box<ServeArgs>),
}

impl Command {
    pub fn overrides(&self) -> &ServeOverrides {
        match self {
            Command::Serve(args) | Command::CheckConfig(args) => &args.overrides,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override how long entries are served as fresh.
    #[arg(long = "cache-ttl-seconds", value_name = "SECONDS")]
    pub cache_ttl_seconds: Option<u64>,

    /// Override how long entries may be served stale.
    #[arg(long = "cache-stale-ttl-seconds", value_name = "SECONDS")]
    pub cache_stale_ttl_seconds: Option<u64>,

    /// Override the live session heartbeat period.
    #[arg(long = "live-heartbeat-seconds", value_name = "SECONDS")]
    pub live_heartbeat_seconds: Option<u64>,

    /// Override the live session lifetime.
    #[arg(long = "live-session-lifetime-seconds", value_name = "SECONDS")]
    pub live_session_lifetime_seconds: Option<u64>,

    /// Override the hosting platform's connection limit.
    #[arg(long = "live-platform-limit-seconds", value_name = "SECONDS")]
    pub live_platform_limit_seconds: Option<u64>,

    /// Override the upstream API base URL.
    #[arg(long = "upstream-base-url", value_name = "URL", value_hint = ValueHint::Url)]
    pub upstream_base_url: Option<String>,

    /// Override the upstream request timeout.
    #[arg(long = "upstream-timeout-seconds", value_name = "SECONDS")]
    pub upstream_timeout_seconds: Option<u64>,
}
