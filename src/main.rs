//! Marketplace rankings engine
//!
//! Runs the scheduled ranking passes, the sale event consumer and the
//! rankings API in one process.
//!
//! # Graceful Shutdown
//!
//! On SIGTERM or SIGINT every service stops through a shared broadcast,
//! pending deferred recomputes are cancelled and running passes finish
//! before the database pool is closed.

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use market_rankings::api::{self, AppState};
use market_rankings::config::{ApiConfig, Config};
use market_rankings::database::{self, Database};
use market_rankings::error::Result;
use market_rankings::event_processor;
use market_rankings::ranking::scheduler::{spawn_scheduler, Schedule};
use market_rankings::ranking::{
    FileWeightSource, PgMetricSource, PgRankingStore, RankingCache, RecomputeOrchestrator,
};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_tracing();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  🏆 Marketplace Rankings Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");

    let config = Arc::new(Config::from_env()?);
    info!("✅ Configuration loaded and validated");

    #[cfg(feature = "prometheus")]
    init_metrics_exporter();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let db = Database::new(&config.database).await?;
    info!("✅ Database connection pool established");

    database::run_migrations(db.pool()).await?;
    info!("✅ Database migrations applied");

    let cache = Arc::new(RankingCache::new(
        config.ranking.cache_ttl,
        config.ranking.cache_max_entries,
    ));
    let orchestrator = RecomputeOrchestrator::new(
        Arc::new(PgMetricSource::new(db.pool().clone())),
        Arc::new(PgRankingStore::new(db.pool().clone())),
        cache.clone(),
        Arc::new(FileWeightSource::new(config.ranking.weights_file.clone())),
        config.ranking.engine_settings(),
    )
    .await?;
    info!("✅ Ranking orchestrator ready");

    let mut handles = Vec::new();

    info!("📊 Starting ranking schedulers...");
    handles.push(spawn_scheduler(
        orchestrator.clone(),
        Schedule::daily(config.ranking.daily_interval).run_on_start(config.ranking.run_on_start),
        shutdown_tx.subscribe(),
    ));
    handles.push(spawn_scheduler(
        orchestrator.clone(),
        Schedule::trending(config.ranking.trending_interval),
        shutdown_tx.subscribe(),
    ));
    handles.push(spawn_cache_sweeper(cache, shutdown_tx.subscribe()));

    if config.kafka.enabled {
        info!("🎯 Starting sale event consumer...");
        handles.push(event_processor::spawn_event_processor(
            config.kafka.clone(),
            orchestrator.clone(),
            shutdown_tx.subscribe(),
        ));
    } else {
        info!("Kafka disabled, sales are accepted over HTTP only");
    }

    let state = Arc::new(AppState::new(
        orchestrator.clone(),
        config.ranking.max_page_size,
    ));
    info!("🌐 Starting API server on port {}...", config.api.port);
    handles.push(spawn_api_server(
        state,
        config.api.clone(),
        shutdown_tx.subscribe(),
    ));

    info!("═══════════════════════════════════════════════════════════════");
    info!("  ✅ All services started successfully");
    info!("  📡 API: http://{}:{}", config.api.host, config.api.port);
    info!(
        "  🔗 Health: http://{}:{}/health",
        config.api.host, config.api.port
    );
    info!("═══════════════════════════════════════════════════════════════");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("📴 Shutdown signal received");
        }
        _ = wait_for_any_failure(&mut handles) => {
            warn!("⚠️ A service stopped unexpectedly, initiating shutdown");
        }
    }

    info!("🛑 Initiating graceful shutdown...");
    let _ = shutdown_tx.send(());

    let shutdown_timeout = Duration::from_secs(30);
    let drained = async {
        shutdown_services(handles).await;
        orchestrator.shutdown().await;
    };
    if tokio::time::timeout(shutdown_timeout, drained).await.is_err() {
        warn!("⚠️ Shutdown timeout exceeded, forcing exit");
    }

    db.close().await;

    info!("👋 Rankings engine stopped gracefully");
    Ok(())
}

/// Initialize structured logging
///
/// `LOG_FORMAT=json` switches stdout to JSON lines; `LOG_DIR` adds a daily
/// rolling JSON file. The returned guard must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("market_rankings=debug,tower_http=debug,sqlx=warn,rdkafka=warn,info")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let (file_layer, guard) = match std::env::var("LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "market-rankings.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(std::env::var("NO_COLOR").is_err())
    });
    let json_layer = json.then(|| fmt::layer().json().with_current_span(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    guard
}

#[cfg(feature = "prometheus")]
fn init_metrics_exporter() {
    let port: u16 = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9000);

    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
    {
        Ok(()) => info!("📈 Prometheus metrics on :{}/metrics", port),
        Err(e) => warn!("Failed to start Prometheus exporter: {}", e),
    }
}

/// Drop expired cache pages periodically
fn spawn_cache_sweeper(
    cache: Arc<RankingCache>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = cache.purge_expired().await;
                    if removed > 0 {
                        info!("🧹 Purged {} expired ranking pages", removed);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Cache sweeper shutting down");
                    break;
                }
            }
        }
    })
}

fn spawn_api_server(
    state: Arc<AppState>,
    config: ApiConfig,
    shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = api::start_server(state, &config, shutdown_rx).await {
            error!("API server error: {}", e);
        }
    })
}

/// Wait for any task to finish before shutdown was requested
async fn wait_for_any_failure(handles: &mut [JoinHandle<()>]) {
    loop {
        if handles.iter().any(|h| h.is_finished()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn shutdown_services(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Service task ended abnormally: {}", e);
        }
    }
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}
