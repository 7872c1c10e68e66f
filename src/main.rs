use std::{future::IntoFuture, process, sync::Arc};

use recordcache::{
    application::{error::AppError, records::RecordSource},
    cache::{CacheConfig, CacheRules, CacheStore},
    config::{self, CacheBackendKind, CacheSettings},
    infra::{
        cache_warmer::{CacheWarmer, WarmerConfig},
        error::InfraError,
        http::{self, AppState},
        records::{InstrumentedSource, MemoryRecords},
        telemetry,
    },
    monitor::{MonitorConfig, QueryMonitor},
};
use tokio::sync::Notify;
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
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;
    telemetry::report_config_warnings(&settings.warnings);

    match command {
        config::Command::Serve(args) => run_serve(settings, *args).await,
    }
}

async fn run_serve(settings: config::Settings, args: config::ServeArgs) -> Result<(), AppError> {
    let monitor = Arc::new(QueryMonitor::new(MonitorConfig::from(&settings.monitor)));

    let records = match args.seed_file.as_deref() {
        Some(path) => MemoryRecords::from_seed_file(path).await?,
        None => MemoryRecords::new(),
    };
    let records: Arc<dyn RecordSource> =
        Arc::new(InstrumentedSource::new(records, monitor.clone()));

    let cache = build_cache_store(&settings.cache).await;
    let warmer_config = WarmerConfig::from(&settings.warmer);
    let warmer = Arc::new(CacheWarmer::new(
        cache.clone(),
        records.clone(),
        warmer_config.clone(),
    ));

    // A schedule warms immediately, so a separate startup pass is only needed without one.
    match warmer_config.interval {
        Some(interval) => warmer.scheduled_warming(interval),
        None if warmer_config.on_startup => {
            let startup = warmer.clone();
            tokio::spawn(async move {
                startup.warm_cache().await;
            });
        }
        None => {}
    }

    let state = AppState {
        records,
        monitor,
        cache,
        warmer: warmer.clone(),
    };

    let result = serve_http(&settings, state, warmer.clone()).await;
    warmer.shutdown();
    result
}

async fn build_cache_store(settings: &CacheSettings) -> CacheStore {
    let config = CacheConfig::from(settings);
    if !config.enabled {
        info!(target = "recordcache::cache", "response cache disabled");
        return CacheStore::in_memory(config);
    }

    match settings.backend {
        CacheBackendKind::Memory => CacheStore::in_memory(config),
        CacheBackendKind::Redis => connect_redis(settings, config).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(settings: &CacheSettings, config: CacheConfig) -> CacheStore {
    use std::time::Duration;

    use recordcache::cache::RedisBackend;

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    let Some(url) = settings.redis_url.as_deref() else {
        return CacheStore::in_memory(config);
    };

    match tokio::time::timeout(CONNECT_TIMEOUT, RedisBackend::connect(url)).await {
        Ok(Ok(backend)) => {
            info!(target = "recordcache::cache", "connected to redis cache backend");
            CacheStore::new(config, Arc::new(backend))
        }
        Ok(Err(err)) => {
            warn!(
                target = "recordcache::cache",
                error = %err,
                "redis unavailable; using the memory backend"
            );
            CacheStore::in_memory(config)
        }
        Err(_) => {
            warn!(
                target = "recordcache::cache",
                timeout_secs = CONNECT_TIMEOUT.as_secs(),
                "redis connection timed out; using the memory backend"
            );
            CacheStore::in_memory(config)
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_settings: &CacheSettings, config: CacheConfig) -> CacheStore {
    warn!(
        target = "recordcache::cache",
        "built without the `redis` feature; using the memory backend"
    );
    CacheStore::in_memory(config)
}

async fn serve_http(
    settings: &config::Settings,
    state: AppState,
    warmer: Arc<CacheWarmer>,
) -> Result<(), AppError> {
    let router = http::build_router(state, CacheRules::default().expose_key(true));

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "recordcache::http",
        addr = %settings.server.addr,
        "listening"
    );

    let draining = Arc::new(Notify::new());
    let signal = {
        let draining = draining.clone();
        async move {
            shutdown_signal().await;
            warmer.shutdown();
            draining.notify_one();
        }
    };

    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(signal)
        .into_future();
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => result,
        _ = draining.notified() => {
            match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        target = "recordcache::http",
                        timeout_secs = settings.server.graceful_shutdown.as_secs(),
                        "graceful shutdown timed out; dropping open connections"
                    );
                    Ok(())
                }
            }
        }
    };

    result.map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "recordcache::http", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "recordcache::http", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(target = "recordcache::http", "shutdown signal received; draining");
}
