use super::*;

#[test]
fn defaults_resolve() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert_eq!(settings.cache.ttl, Duration::from_secs(60));
    assert_eq!(settings.cache.stale_ttl, Duration::from_secs(300));
    assert_eq!(settings.live.heartbeat_interval, Duration::from_secs(30));
    assert_eq!(settings.live.session_lifetime, Duration::from_secs(290));
    assert_eq!(settings.live.platform_connection_limit, Duration::from_secs(300));
    assert_eq!(settings.upstream.base_url.as_str(), DEFAULT_UPSTREAM_BASE_URL);
    assert!(settings.upstream.api_token.is_none());
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn default_cache_settings_match_store_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(
        crate::cache::CacheConfig::from(&settings.cache),
        crate::cache::CacheConfig::default()
    );
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.cache.ttl_seconds = Some(30);

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        cache_ttl_seconds: Some(45),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.ttl, Duration::from_secs(45));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    raw.apply_serve_overrides(&ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn stale_ttl_must_exceed_ttl() {
    let mut raw = RawSettings::default();
    raw.cache.ttl_seconds = Some(120);
    raw.cache.stale_ttl_seconds = Some(120);

    let err = Settings::from_raw(raw).expect_err("stale window is empty");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.stale_ttl_seconds",
            ..
        }
    ));
}

#[test]
fn session_lifetime_must_stay_under_platform_limit() {
    let mut raw = RawSettings::default();
    raw.live.session_lifetime_seconds = Some(300);

    let err = Settings::from_raw(raw).expect_err("lifetime reaches platform limit");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "live.session_lifetime_seconds",
            ..
        }
    ));
}

#[test]
fn heartbeat_must_be_shorter_than_lifetime() {
    let mut raw = RawSettings::default();
    raw.live.heartbeat_seconds = Some(290);

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn zero_durations_rejected() {
    let mut raw = RawSettings::default();
    raw.upstream.request_timeout_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.live.channel_capacity = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn upstream_url_is_validated() {
    let mut raw = RawSettings::default();
    raw.upstream.base_url = Some("ftp://crm.example.com".to_string());
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.upstream.base_url = Some("not a url".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn api_token_is_trimmed_and_redacted() {
    let mut raw = RawSettings::default();
    raw.upstream.api_token = Some("  secret-token \n".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.upstream.api_token.as_deref(), Some("secret-token"));
    let rendered = format!("{:?}", settings.upstream);
    assert!(!rendered.contains("secret-token"));
    assert!(rendered.contains("<redacted>"));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["pulsecache"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_check_config_overrides() {
    let args = CliArgs::parse_from([
        "pulsecache",
        "check-config",
        "--cache-ttl-seconds",
        "15",
        "--upstream-base-url",
        "https://crm.example.com/api/",
        "--log-json",
        "true",
    ]);

    match args.command.expect("check-config command") {
        Command::CheckConfig(check) => {
            assert_eq!(check.overrides.cache_ttl_seconds, Some(15));
            assert_eq!(
                check.overrides.upstream_base_url.as_deref(),
                Some("https://crm.example.com/api/")
            );
            assert_eq!(check.overrides.log_json, Some(true));
        }
        _ => panic!("wrong command parsed"),
    }
}
