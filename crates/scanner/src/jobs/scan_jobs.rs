use anyhow::Result;
use common::config::Config;
use common::store::Store;
use common::types::{WalletTag, WinRateOutcome};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::fetcher_traits::{ChainData, PositionsPager, TradeFetch};
use super::tracker::JobTracker;
use crate::risk_scoring::RiskScoringEngine;
use crate::scan::{self, ScanResult};
use crate::trade_sources::TradeSourceAggregator;
use crate::win_rate::{self, WinRateAggregator};

/// How many flagged wallets one refresh pass will touch.
const WIN_RATE_REFRESH_LIMIT: u32 = 200;

/// Wallets between progress snapshots in `job_status` metadata.
const WIN_RATE_PROGRESS_STRIDE: usize = 25;

/// One tracked scan cycle. The cycle summary lands in `job_status`
/// metadata so `scanner status` can show what the last run did.
pub async fn run_scan_once<C, F>(
    aggregator: &mut TradeSourceAggregator<F>,
    engine: &Arc<RiskScoringEngine<C>>,
    store: &Store,
    cfg: &Config,
) -> Result<ScanResult>
where
    C: ChainData + Send + Sync + 'static,
    F: TradeFetch + Sync,
{
    let tracker = JobTracker::start(store.db(), "wallet_scan").await?;
    match scan::run_scan(aggregator, engine, store, cfg, cfg.scan.batch_limit).await {
        Ok(result) => {
            tracker.success(Some(serde_json::to_value(&result)?)).await?;
            Ok(result)
        }
        Err(e) => {
            tracker.fail(&e).await?;
            Err(e)
        }
    }
}

/// One tracked win-rate refresh over currently flagged wallets. Returns
/// `(computed, skipped)`.
pub async fn run_win_rate_refresh_once<P>(
    aggregator: &WinRateAggregator<P>,
    store: &Store,
    cfg: &Config,
) -> Result<(u64, u64)>
where
    P: PositionsPager + Send + Sync,
{
    let tracker = JobTracker::start(store.db(), "win_rate_refresh").await?;
    match refresh_win_rates(aggregator, store, cfg, &tracker).await {
        Ok((computed, skipped)) => {
            tracker
                .success(Some(serde_json::json!({
                    "computed": computed,
                    "skipped": skipped,
                })))
                .await?;
            Ok((computed, skipped))
        }
        Err(e) => {
            tracker.fail(&e).await?;
            Err(e)
        }
    }
}

async fn refresh_win_rates<P>(
    aggregator: &WinRateAggregator<P>,
    store: &Store,
    cfg: &Config,
    tracker: &JobTracker,
) -> Result<(u64, u64)>
where
    P: PositionsPager + Send + Sync,
{
    let wallets = store.list_flagged_wallets(WIN_RATE_REFRESH_LIMIT).await?;
    metrics::gauge!("scanner_flagged_wallets").set(wallets.len() as f64);

    let total = wallets.len();
    let mut computed: u64 = 0;
    let mut skipped: u64 = 0;
    for (idx, wallet) in wallets.into_iter().enumerate() {
        match aggregator.compute(&wallet.address).await {
            Ok(WinRateOutcome::Computed(summary)) => {
                store.upsert_win_rate(&wallet.address, summary).await?;
                let high = win_rate::is_high_win_rate(&summary, cfg.win_rate.threshold_pct);
                if high != wallet.is_high_win_rate {
                    store.set_wallet_high_win_rate(&wallet.address, high).await?;
                    info!(
                        wallet = %wallet.address,
                        rate = summary.win_rate_pct,
                        tag = WalletTag::HighWinRate.as_str(),
                        tagged = high,
                        "win-rate tag changed"
                    );
                }
                computed += 1;
                metrics::counter!("scanner_win_rates_computed_total").increment(1);
            }
            Ok(WinRateOutcome::NotEnoughData { valid_positions }) => {
                debug!(wallet = %wallet.address, valid_positions, "not enough closed positions");
                skipped += 1;
            }
            Err(e) => {
                // Win rate is enrichment; a failed wallet is skipped, not fatal.
                warn!(wallet = %wallet.address, error = %e, "win rate computation failed");
                skipped += 1;
            }
        }

        if (idx + 1) % WIN_RATE_PROGRESS_STRIDE == 0 {
            tracker
                .update_progress(serde_json::json!({
                    "processed": idx + 1,
                    "total": total,
                    "computed": computed,
                    "skipped": skipped,
                }))
                .await?;
        }
    }

    info!(computed, skipped, "win rate refresh complete");
    Ok((computed, skipped))
}
