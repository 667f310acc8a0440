use anyhow::Result;
use std::sync::Arc;
use tracing::Instrument;

mod cli;
mod jobs;
mod metrics;
mod risk_scoring;
mod scan;
mod scheduler;
mod trade_sources;
mod win_rate;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let dispatch = common::observability::build_dispatch(&config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    tracing::info!("insider_scan starting");

    if let Some(dir) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(dir)?;
    }

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;

    // One-shot commands share the AsyncDb path and exit when done.
    if cmd != cli::Command::Run {
        let db = common::db::AsyncDb::open(&config.database.path).await?;
        let store = common::store::Store::new(db);
        let cfg = Arc::new(config);
        let api = Arc::new(common::polymarket::PolymarketClient::new(&cfg.sources)?);
        let chain = Arc::new(common::chain::ChainDataProvider::new(&cfg.chain)?);
        return cli::run_command(cmd, &store, api, chain, cfg).await;
    }

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    // AsyncDb runs all SQLite work on a dedicated background thread.
    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let store = common::store::Store::new(db.clone());

    let cfg = Arc::new(config);
    let api = Arc::new(common::polymarket::PolymarketClient::new(&cfg.sources)?);
    let chain = Arc::new(common::chain::ChainDataProvider::new(&cfg.chain)?);

    // The dedup set inside the aggregator lives for the whole process, so the
    // scan worker owns a single aggregator across every cycle.
    let mut scan_aggregator = trade_sources::TradeSourceAggregator::new(api.clone(), &cfg.sources)?;
    let engine = Arc::new(risk_scoring::RiskScoringEngine::new(
        chain.clone(),
        store.clone(),
        cfg.clone(),
    ));
    let win_rate_aggregator = win_rate::WinRateAggregator::new(api.clone(), cfg.clone());

    let (scan_tx, mut scan_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (win_rate_tx, mut win_rate_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (checkpoint_tx, mut checkpoint_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (stats_tx, mut stats_rx) = tokio::sync::mpsc::channel::<()>(8);

    // Spawn worker loops before the scheduler so immediate ticks land on a
    // listening receiver.
    tokio::spawn({
        let cfg = cfg.clone();
        let store = store.clone();
        async move {
            while scan_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "wallet_scan");
                async {
                    match jobs::run_scan_once(
                        &mut scan_aggregator,
                        &engine,
                        &store,
                        cfg.as_ref(),
                    )
                    .await
                    {
                        Ok(result) => tracing::info!(
                            source = %result.source,
                            trades = result.total_trades,
                            new = result.new_wallets,
                            suspicious = result.suspicious_wallets,
                            errors = result.errors,
                            "wallet_scan done"
                        ),
                        Err(e) => tracing::error!(error = %e, "wallet_scan failed"),
                    }
                }
                .instrument(span)
                .await;
            }
        }
    });

    tokio::spawn({
        let cfg = cfg.clone();
        let store = store.clone();
        async move {
            while win_rate_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "win_rate_refresh");
                async {
                    match jobs::run_win_rate_refresh_once(&win_rate_aggregator, &store, cfg.as_ref())
                        .await
                    {
                        Ok((computed, skipped)) => {
                            tracing::info!(computed, skipped, "win_rate_refresh done");
                        }
                        Err(e) => tracing::error!(error = %e, "win_rate_refresh failed"),
                    }
                }
                .instrument(span)
                .await;
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        async move {
            while checkpoint_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "wal_checkpoint");
                async {
                    match jobs::run_wal_checkpoint_once(&db).await {
                        Ok(cp) => {
                            tracing::info!(
                                log_pages = cp.log_pages,
                                checkpointed_pages = cp.checkpointed_pages,
                                "wal_checkpoint done"
                            );
                        }
                        Err(e) => tracing::error!(error = %e, "wal_checkpoint failed"),
                    }
                }
                .instrument(span)
                .await;
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        let db_path = cfg.database.path.clone();
        async move {
            while stats_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "sqlite_stats");
                async {
                    if let Err(e) = jobs::run_sqlite_stats_once(&db, &db_path).await {
                        tracing::error!(error = %e, "sqlite_stats failed");
                    }
                }
                .instrument(span)
                .await;
            }
        }
    });

    tracing::info!("worker loops ready");

    let spec = |name: &str, secs: u64, tick, run_immediately| scheduler::JobSpec {
        name: name.to_string(),
        interval: std::time::Duration::from_secs(secs),
        tick,
        run_immediately,
    };
    let _scheduler_handles = scheduler::start(vec![
        spec("wallet_scan", cfg.scan.interval_secs, scan_tx, true),
        spec(
            "win_rate_refresh",
            cfg.win_rate.refresh_interval_secs,
            win_rate_tx,
            true,
        ),
        // A checkpoint at startup would have nothing to fold back.
        spec(
            "wal_checkpoint",
            cfg.database.checkpoint_interval_secs,
            checkpoint_tx,
            false,
        ),
        spec("sqlite_stats", 60, stats_tx, true),
    ]);
    tracing::info!("scheduler started, first scan fires immediately");

    tokio::signal::ctrl_c().await?;
    tracing::info!("ctrl-c received, shutting down");

    // Workers get five seconds to wrap up the tick in flight.
    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        tracing::warn!("shutdown grace period elapsed, exiting");
        std::process::exit(0);
    });

    Ok(())
}
