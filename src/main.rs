use anyhow::{Context, Result};
use clap::Parser;
use hydronet_core::services::aggregation::{AggregationEngine, AggregationSettings};
use hydronet_core::services::anomaly::AnomalyScanner;
use hydronet_core::services::cache_sync::CacheSynchronizer;
use hydronet_core::services::efficiency::EfficiencyRollup;
use hydronet_core::services::jobs::{JobKind, PipelineJobService};
use hydronet_core::services::ml::{HttpForecastService, PredictionManager, PredictionSettings};
use hydronet_core::services::scheduler::Scheduler;
use hydronet_core::{cache, cli, config, db, openapi, retry, routes, state, warehouse};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{Any, CorsLayer};

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind hydronet-core listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind hydronet-core listener on {addr}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = cli::Args::parse();
    if args.print_openapi {
        println!("{}", serde_json::to_string_pretty(&openapi::openapi_json())?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::HydroConfig::from_env()?;
    let pool = db::connect_lazy(&config.database_url)?;
    db::run_migrations(&pool).await?;

    let http = reqwest::Client::new();
    let hot_cache: Arc<dyn cache::KeyValueCache> = Arc::new(cache::MemoryCache::new());
    let backoff = retry::BackoffPolicy::default();

    let readings: Arc<dyn warehouse::ReadingStore> = Arc::new(warehouse::HttpWarehouse::new(
        config.warehouse_base_url.clone(),
        config.warehouse_api_token.clone(),
        http.clone(),
        backoff.clone(),
    ));
    let forecaster = Arc::new(HttpForecastService::new(
        config.forecast_base_url.clone(),
        config.forecast_api_token.clone(),
        http.clone(),
        backoff,
    ));

    let cache_ttl = Duration::from_secs(config.cache_ttl_seconds);
    let aggregation = Arc::new(AggregationEngine::new(
        pool.clone(),
        readings,
        AggregationSettings::from_config(&config),
    ));
    let cache_sync = Arc::new(CacheSynchronizer::new(
        pool.clone(),
        hot_cache.clone(),
        cache_ttl,
    ));
    let predictions = Arc::new(PredictionManager::new(
        pool.clone(),
        forecaster.clone(),
        PredictionSettings::from_config(&config),
    ));
    let anomaly = Arc::new(AnomalyScanner::new(
        pool.clone(),
        hot_cache.clone(),
        forecaster,
        cache_ttl,
        config.anomaly_z_threshold,
        config.anomaly_lookback_hours,
    ));
    let efficiency = Arc::new(EfficiencyRollup::new(pool.clone()));

    let jobs = Arc::new(PipelineJobService::new(
        pool.clone(),
        config.clone(),
        aggregation,
        cache_sync,
        predictions,
        anomaly,
        efficiency,
    ));

    let cancel = CancellationToken::new();
    let mut scheduler = Scheduler::new(
        jobs.clone(),
        Duration::from_secs(config.scheduler_poll_interval_seconds),
    );
    scheduler.schedule(JobKind::FullSync, config.triggers.full_sync);
    scheduler.schedule(JobKind::CacheRefresh, config.triggers.cache_refresh);
    scheduler.schedule(JobKind::RealtimeSync, config.triggers.realtime_sync);
    scheduler.schedule(JobKind::AnomalyScan, config.triggers.anomaly_scan);
    scheduler.schedule(JobKind::QualityCheck, config.triggers.quality_check);
    scheduler.schedule(JobKind::EfficiencyRollup, config.triggers.efficiency_rollup);
    scheduler.schedule(JobKind::RetentionCleanup, config.triggers.retention_cleanup);
    scheduler.schedule(JobKind::ModelEvaluation, config.triggers.model_evaluation);
    scheduler.start(cancel.clone());

    let state = state::AppState {
        config,
        db: pool,
        cache: hot_cache,
        jobs,
        http,
    };

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(60)
            .methods(vec![
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::DELETE,
            ])
            .use_headers()
            .finish()
            .context("failed to build rate limiter config")?,
    );
    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        governor_limiter.retain_recent();
    });

    // The dashboard UI is served from a different origin than this API.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    let app = routes::router(state)
        .layer(GovernorLayer::new(governor_conf))
        .layer(cors);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(addr = %addr, "hydronet-core listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    cancel.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use_with_actionable_message() -> Result<()> {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Sandbox environments can block binding attempts.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;

        let err = bind_listener(&addr.to_string()).await.unwrap_err();
        if err
            .to_string()
            .to_lowercase()
            .contains("operation not permitted")
        {
            // Sandbox environments can block binding attempts; skip assertions in that case.
            return Ok(());
        }
        let message = err.to_string().to_lowercase();

        assert!(message.contains(&addr.to_string()));
        assert!(message.contains("port already in use"));
        assert!(message.contains("--port"));

        drop(listener);
        Ok(())
    }
}
