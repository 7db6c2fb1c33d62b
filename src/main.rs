use std::{process, sync::Arc};

use pulsecache::{
    application::{data::DataService, error::AppError},
    cache::{CacheConfig, DataCache},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
    live::LiveConfig,
    upstream::{HttpUpstream, Upstream},
};
use tokio::{signal, sync::oneshot};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;
    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::CheckConfig(_) => {
            println!("{settings:#?}");
            Ok(())
        }
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging)?;
            run_serve(settings).await
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache = DataCache::new(CacheConfig::from(&settings.cache));
    let upstream: Arc<dyn Upstream> =
        Arc::new(HttpUpstream::from_settings(&settings.upstream).map_err(InfraError::from)?);
    let state = HttpState {
        data: DataService::new(cache, upstream),
        live: LiveConfig::from(&settings.live),
    };

    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;

    info!(
        addr = %settings.server.addr,
        upstream = %settings.upstream.base_url,
        ttl_secs = settings.cache.ttl.as_secs(),
        stale_ttl_secs = settings.cache.stale_ttl.as_secs(),
        "Serving"
    );

    let grace = settings.server.graceful_shutdown;
    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(());
        },
    );
    let mut server = tokio::spawn(async move { server.await });

    // Live streams never end on their own, so draining is bounded by the grace period.
    let deadline = async move {
        if signalled_rx.await.is_ok() {
            tokio::time::sleep(grace).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        joined = &mut server => match joined {
            Ok(result) => result.map_err(InfraError::from)?,
            Err(err) => warn!(error = %err, "Server task ended abnormally"),
        },
        () = deadline => {
            warn!(grace_secs = grace.as_secs(), "Graceful shutdown timed out; dropping open connections");
            server.abort();
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
