use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;

use hornpub_runner::admin::run_admin_server;
use hornpub_runner::config::Settings;
use hornpub_runner::db::{PgKlineStore, PgLogStore, PgPositionStore, PgRunStore};
use hornpub_runner::market::{BinanceVenueAdapter, Interval, KlineManager, SeriesCache};
use hornpub_runner::scheduler::{claim, Scheduler, SchedulerConfig};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    tracing::info!("starting hornpub-runner");

    let settings = Settings::new().unwrap_or_else(|e| {
        eprintln!("failed to load settings: {e}");
        std::process::exit(1);
    });

    let pg_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.database_url)
        .await
        .expect("postgres connection");

    sqlx::migrate!("./migrations").run(&pg_pool).await.expect("migrations");

    let klines: Arc<dyn hornpub_runner::db::KlineStore> = Arc::new(PgKlineStore::new(pg_pool.clone()));
    let positions: Arc<dyn hornpub_runner::db::PositionStore> = Arc::new(PgPositionStore::new(pg_pool.clone()));
    let logs: Arc<dyn hornpub_runner::db::LogStore> = Arc::new(PgLogStore::new(pg_pool.clone()));
    let runs: Arc<dyn hornpub_runner::db::RunStore> = Arc::new(PgRunStore::new(pg_pool.clone()));
    let cache = Arc::new(SeriesCache::new(settings.indicator_max_candles));
    let venue: Arc<dyn hornpub_runner::market::VenueAdapter> =
        Arc::new(BinanceVenueAdapter::new(settings.binance_base_url.clone()));
    let symbol_provider = claim::shared(pg_pool.clone(), settings.active_project_statuses.clone());

    // --- kline manager ------------------------------------------------------
    {
        let manager = KlineManager::new(
            "binance",
            Interval::OneMin,
            Arc::clone(&klines),
            Arc::clone(&venue),
            Arc::clone(&cache),
            symbol_provider,
            settings.kline_retention_days,
            settings.kline_max_concurrency,
            settings.kline_refresh_interval(),
        );
        tokio::spawn(async move {
            manager.run(|| chrono::Utc::now().timestamp_millis()).await;
        });
    }

    // --- scheduler ------------------------------------------------------------
    {
        let scheduler = Scheduler::new(
            runs,
            positions,
            logs,
            klines,
            cache,
            SchedulerConfig {
                exchange: "binance".to_string(),
                default_tf: Interval::OneMin,
                claim_limit: 10,
                indicator_max_candles: settings.indicator_max_candles,
                sandbox_timeout_ms: settings.sandbox_timeout_ms,
            },
        );
        let tick_every = settings.scheduler_tick_interval();
        tokio::spawn(async move {
            scheduler.run(tick_every).await;
        });
    }

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder installs once per process");

    run_admin_server(settings.admin_port, prometheus).await?;
    Ok(())
}
