//! One scan cycle: fetch a trade batch, group it by wallet, and run every
//! unique wallet through the scoring pipeline under a concurrency bound
//! and a cycle deadline.
//!
//! Only the trade fetch itself can fail the cycle. Everything per-wallet
//! is counted and reported instead of propagated, so one broken wallet
//! never sinks the batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use common::config::Config;
use common::store::{CreateOutcome, NewTradeEvent, NewWallet, Store};
use common::types::Trade;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::jobs::{ChainData, TradeFetch};
use crate::risk_scoring::{RiskScoringEngine, RiskVerdict, ScoreOutcome};
use crate::trade_sources::TradeSourceAggregator;

/// Aggregate outcome of one scan cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub source: String,
    pub total_trades: u64,
    pub processed_wallets: u64,
    pub new_wallets: u64,
    pub suspicious_wallets: u64,
    pub skipped_wallets: u64,
    pub errors: u64,
    pub flagged: Vec<FlaggedWallet>,
    pub failures: Vec<WalletFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlaggedWallet {
    pub address: String,
    pub score: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletFailure {
    pub address: String,
    pub reason: String,
}

#[derive(Default)]
struct ScanCounters {
    processed: AtomicU64,
    new: AtomicU64,
    suspicious: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

enum WalletOutcome {
    Known,
    NewClean { score: u32 },
    Flagged { score: u32 },
    /// Lost a create race to a sibling worker; treated as already known.
    AlreadyExists,
}

pub async fn run_scan<C, F>(
    aggregator: &mut TradeSourceAggregator<F>,
    engine: &Arc<RiskScoringEngine<C>>,
    store: &Store,
    cfg: &Config,
    limit: u32,
) -> Result<ScanResult>
where
    C: ChainData + Send + Sync + 'static,
    F: TradeFetch + Sync,
{
    let started = std::time::Instant::now();
    let batch = aggregator.fetch_trades(limit).await?;
    let source = batch.source.as_str().to_string();
    let total_trades = batch.trades.len() as u64;

    let mut by_wallet: HashMap<String, Vec<Trade>> = HashMap::new();
    for t in batch.trades {
        by_wallet.entry(t.maker_address.clone()).or_default().push(t);
    }
    info!(source = %source, trades = total_trades, wallets = by_wallet.len(), "scan cycle starting");

    let counters = Arc::new(ScanCounters::default());
    let flagged = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let failures = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let semaphore = Arc::new(Semaphore::new(cfg.scan.concurrency));
    let deadline =
        tokio::time::Instant::now() + std::time::Duration::from_secs(cfg.scan.deadline_secs);

    let mut workers = JoinSet::new();
    for (address, trades) in by_wallet {
        let engine = engine.clone();
        let store = store.clone();
        let counters = counters.clone();
        let flagged = flagged.clone();
        let failures = failures.clone();
        let semaphore = semaphore.clone();
        workers.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore is never closed while workers run.
                Err(_) => return,
            };

            if tokio::time::Instant::now() >= deadline {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(wallet = %address, "scan deadline exceeded before processing");
                failures.lock().await.push(WalletFailure {
                    address,
                    reason: "scan deadline exceeded before processing".to_string(),
                });
                return;
            }

            match process_wallet(&engine, &store, &address, &trades).await {
                Ok(outcome) => {
                    counters.processed.fetch_add(1, Ordering::Relaxed);
                    match outcome {
                        WalletOutcome::Known | WalletOutcome::AlreadyExists => {
                            counters.skipped.fetch_add(1, Ordering::Relaxed);
                        }
                        WalletOutcome::NewClean { score } => {
                            counters.new.fetch_add(1, Ordering::Relaxed);
                            debug!(wallet = %address, score, "new wallet, not suspicious");
                        }
                        WalletOutcome::Flagged { score } => {
                            counters.new.fetch_add(1, Ordering::Relaxed);
                            counters.suspicious.fetch_add(1, Ordering::Relaxed);
                            info!(wallet = %address, score, "suspicious wallet flagged");
                            flagged.lock().await.push(FlaggedWallet { address, score });
                        }
                    }
                }
                Err(e) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    error!(wallet = %address, error = %e, "wallet processing failed");
                    failures.lock().await.push(WalletFailure {
                        address,
                        reason: format!("{e:#}"),
                    });
                }
            }
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "scan worker panicked");
        }
    }

    let flagged = std::mem::take(&mut *flagged.lock().await);
    let failures = std::mem::take(&mut *failures.lock().await);
    let result = ScanResult {
        source,
        total_trades,
        processed_wallets: counters.processed.load(Ordering::Relaxed),
        new_wallets: counters.new.load(Ordering::Relaxed),
        suspicious_wallets: counters.suspicious.load(Ordering::Relaxed),
        skipped_wallets: counters.skipped.load(Ordering::Relaxed),
        errors: counters.errors.load(Ordering::Relaxed),
        flagged,
        failures,
    };

    metrics::counter!("scanner_wallets_processed_total").increment(result.processed_wallets);
    metrics::counter!("scanner_wallets_new_total").increment(result.new_wallets);
    metrics::counter!("scanner_wallets_flagged_total").increment(result.suspicious_wallets);
    metrics::counter!("scanner_wallets_skipped_total").increment(result.skipped_wallets);
    metrics::counter!("scanner_scan_errors_total").increment(result.errors);
    metrics::histogram!("scanner_scan_duration_ms").record(started.elapsed().as_secs_f64() * 1000.0);
    metrics::gauge!("scanner_last_scan_epoch").set(chrono::Utc::now().timestamp() as f64);

    info!(
        source = %result.source,
        trades = result.total_trades,
        processed = result.processed_wallets,
        new = result.new_wallets,
        suspicious = result.suspicious_wallets,
        skipped = result.skipped_wallets,
        errors = result.errors,
        "scan cycle complete"
    );
    Ok(result)
}

async fn process_wallet<C: ChainData + Send + Sync>(
    engine: &RiskScoringEngine<C>,
    store: &Store,
    address: &str,
    trades: &[Trade],
) -> Result<WalletOutcome> {
    // Known wallets are never re-scored; a sighting only bumps activity.
    if store.find_wallet_by_address(address).await?.is_some() {
        store.update_wallet_last_active(address).await?;
        debug!(wallet = %address, "known wallet, touched last_active_at");
        return Ok(WalletOutcome::Known);
    }

    match engine.score(address, trades).await? {
        ScoreOutcome::BelowGate { .. } => Ok(WalletOutcome::NewClean { score: 0 }),
        ScoreOutcome::Scored(verdict) if !verdict.is_suspicious => {
            Ok(WalletOutcome::NewClean { score: verdict.score })
        }
        ScoreOutcome::Scored(verdict) => persist_suspicious(store, address, &verdict).await,
    }
}

/// Persist a flagged wallet, its market, and the qualifying trade event.
async fn persist_suspicious(
    store: &Store,
    address: &str,
    verdict: &RiskVerdict,
) -> Result<WalletOutcome> {
    let created = store
        .create_wallet(NewWallet {
            address: address.to_string(),
            risk_score: verdict.score,
            is_suspicious: true,
            funding_source: verdict.funding_source.clone(),
            wallet_created_at: Some(verdict.wallet_created_at),
        })
        .await?;
    if created == CreateOutcome::AlreadyExists {
        warn!(wallet = %address, "wallet already exists, skipping create");
        store.update_wallet_last_active(address).await?;
        return Ok(WalletOutcome::AlreadyExists);
    }

    let trade = &verdict.qualifying_trade;
    ensure_market(store, trade).await?;

    if store.trade_event_exists(address, &trade.asset_id).await? {
        debug!(wallet = %address, market = %trade.asset_id, "trade event already recorded");
    } else {
        store
            .create_trade_event(NewTradeEvent {
                wallet_address: address.to_string(),
                market_id: trade.asset_id.clone(),
                amount_usdc: trade.amount_usdc,
                side: trade.side.clone(),
                traded_at: trade.timestamp,
            })
            .await?;
    }

    Ok(WalletOutcome::Flagged { score: verdict.score })
}

/// Create the market on first sighting, or fold this trade's volume into
/// the existing row.
async fn ensure_market(store: &Store, trade: &Trade) -> Result<()> {
    if store.find_market_by_id(&trade.asset_id).await?.is_some() {
        return store.increment_market_volume(&trade.asset_id, trade.amount_usdc).await;
    }
    match store
        .create_market(&trade.asset_id, trade.title.as_deref(), trade.amount_usdc)
        .await?
    {
        CreateOutcome::Created => Ok(()),
        // Raced with a sibling worker; fold the volume in instead.
        CreateOutcome::AlreadyExists => {
            store.increment_market_volume(&trade.asset_id, trade.amount_usdc).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    use common::chain::{ChainDataUnavailable, FirstActivity, TransferActivity};
    use common::db::AsyncDb;
    use common::types::{ApiActivity, ApiTrade, IndexFill};

    use crate::trade_sources::UpstreamUnavailable;

    use super::*;

    #[derive(Default)]
    struct FakeFetcher {
        data_api: Mutex<VecDeque<Result<Vec<ApiTrade>>>>,
        activity: Mutex<VecDeque<Result<Vec<ApiActivity>>>>,
        index: Mutex<VecDeque<Result<Vec<IndexFill>>>>,
    }

    impl TradeFetch for FakeFetcher {
        async fn data_api_trades(&self, _limit: u32) -> Result<Vec<ApiTrade>> {
            self.data_api
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn activity_trades(&self, _limit: u32) -> Result<Vec<ApiActivity>> {
            self.activity
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn index_fill_trades(&self, _limit: u32) -> Result<Vec<IndexFill>> {
            self.index
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    /// Fresh, barely funded wallet for every address except those in
    /// `fail_for`, which error like a dead indexer.
    struct FakeChain {
        fail_for: HashSet<String>,
        first_epoch: i64,
    }

    impl FakeChain {
        fn fresh() -> Self {
            Self {
                fail_for: HashSet::new(),
                first_epoch: chrono::Utc::now().timestamp() - 3600,
            }
        }

        fn failing_for(addresses: &[&str]) -> Self {
            let mut chain = Self::fresh();
            chain.fail_for = addresses.iter().map(|a| a.to_string()).collect();
            chain
        }
    }

    impl ChainData for FakeChain {
        async fn first_activity(
            &self,
            address: &str,
        ) -> std::result::Result<FirstActivity, ChainDataUnavailable> {
            if self.fail_for.contains(address) {
                return Err(ChainDataUnavailable {
                    address: address.to_string(),
                    reason: "indexer down".to_string(),
                });
            }
            Ok(FirstActivity { epoch: self.first_epoch, funder: Some("0xfunder".to_string()) })
        }

        async fn transaction_count(
            &self,
            address: &str,
        ) -> std::result::Result<TransferActivity, ChainDataUnavailable> {
            if self.fail_for.contains(address) {
                return Err(ChainDataUnavailable {
                    address: address.to_string(),
                    reason: "indexer down".to_string(),
                });
            }
            Ok(TransferActivity { count: 2, capped: false })
        }
    }

    fn config() -> Config {
        include_str!("../../../config/default.toml").parse().unwrap()
    }

    fn api_trade(maker: &str, asset: &str, amount: f64, ts: i64) -> ApiTrade {
        ApiTrade {
            proxy_wallet: Some(maker.to_string()),
            asset: Some(asset.to_string()),
            condition_id: None,
            size: Some(amount.to_string()),
            price: Some("1".to_string()),
            timestamp: Some(ts),
            side: Some("BUY".to_string()),
            title: Some("Will it happen?".to_string()),
        }
    }

    struct Fixture {
        aggregator: TradeSourceAggregator<FakeFetcher>,
        engine: Arc<RiskScoringEngine<FakeChain>>,
        store: Store,
        cfg: Arc<Config>,
    }

    async fn fixture_with(chain: FakeChain, cfg: Config, batches: Vec<Vec<ApiTrade>>) -> Fixture {
        let fetcher = FakeFetcher::default();
        for batch in batches {
            fetcher.data_api.lock().unwrap().push_back(Ok(batch));
        }
        let aggregator = TradeSourceAggregator::new(fetcher, &cfg.sources).unwrap();

        let db = AsyncDb::open_memory().await.unwrap();
        let store = Store::new(db);
        let cfg = Arc::new(cfg);
        let engine = Arc::new(RiskScoringEngine::new(
            Arc::new(chain),
            store.clone(),
            cfg.clone(),
        ));
        Fixture { aggregator, engine, store, cfg }
    }

    #[tokio::test]
    async fn test_scan_flags_fresh_wallet_and_persists_everything() {
        let now = chrono::Utc::now().timestamp();
        let mut fx = fixture_with(
            FakeChain::fresh(),
            config(),
            vec![vec![
                api_trade("0xAAA", "tok-1", 7_000.0, now - 600),
                api_trade("0xAAA", "tok-1", 50.0, now - 500),
            ]],
        )
        .await;

        let result = run_scan(&mut fx.aggregator, &fx.engine, &fx.store, &fx.cfg, 50)
            .await
            .unwrap();

        assert_eq!(result.total_trades, 2);
        assert_eq!(result.processed_wallets, 1);
        assert_eq!(result.new_wallets, 1);
        assert_eq!(result.suspicious_wallets, 1);
        assert_eq!(result.skipped_wallets, 0);
        assert_eq!(result.errors, 0);
        assert_eq!(result.flagged.len(), 1);
        assert_eq!(result.flagged[0].address, "0xaaa");

        let wallet = fx.store.find_wallet_by_address("0xaaa").await.unwrap().unwrap();
        assert!(wallet.is_suspicious);
        assert_eq!(wallet.funding_source.as_deref(), Some("0xfunder"));
        assert!(wallet.wallet_created_at.is_some());

        let market = fx.store.find_market_by_id("tok-1").await.unwrap().unwrap();
        assert!((market.volume_usdc - 7_000.0).abs() < f64::EPSILON);

        assert!(fx.store.trade_event_exists("0xaaa", "tok-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_rerunning_a_scan_only_touches_known_wallets() {
        let now = chrono::Utc::now().timestamp();
        let mut fx = fixture_with(
            FakeChain::fresh(),
            config(),
            vec![
                vec![api_trade("0xAAA", "tok-1", 7_000.0, now - 600)],
                // Same wallet, new fill: survives dedup, hits the known path.
                vec![api_trade("0xAAA", "tok-1", 8_000.0, now - 300)],
            ],
        )
        .await;

        let first = run_scan(&mut fx.aggregator, &fx.engine, &fx.store, &fx.cfg, 50)
            .await
            .unwrap();
        assert_eq!(first.suspicious_wallets, 1);

        // Back-date the activity stamp so the touch is observable.
        fx.store
            .db()
            .call(|conn| {
                conn.execute(
                    "UPDATE wallets SET last_active_at = '2020-01-01 00:00:00'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let second = run_scan(&mut fx.aggregator, &fx.engine, &fx.store, &fx.cfg, 50)
            .await
            .unwrap();
        assert_eq!(second.processed_wallets, 1);
        assert_eq!(second.skipped_wallets, 1);
        assert_eq!(second.new_wallets, 0);
        assert_eq!(second.suspicious_wallets, 0);

        let wallet = fx.store.find_wallet_by_address("0xaaa").await.unwrap().unwrap();
        assert_ne!(wallet.last_active_at, "2020-01-01 00:00:00");
        // Still a single row and the original score.
        assert_eq!(wallet.risk_score, 110);
    }

    #[tokio::test]
    async fn test_every_wallet_is_processed_exactly_once_under_concurrency() {
        let now = chrono::Utc::now().timestamp();
        let batch: Vec<ApiTrade> = (0..20)
            .map(|i| api_trade(&format!("0xW{i:02}"), "tok-1", 10.0, now - 600 - i))
            .collect();
        let mut fx = fixture_with(FakeChain::fresh(), config(), vec![batch]).await;
        assert_eq!(fx.cfg.scan.concurrency, 3);

        let result = run_scan(&mut fx.aggregator, &fx.engine, &fx.store, &fx.cfg, 50)
            .await
            .unwrap();

        // All below the gate: processed and new, nothing persisted.
        assert_eq!(result.processed_wallets, 20);
        assert_eq!(result.new_wallets, 20);
        assert_eq!(result.suspicious_wallets, 0);
        assert_eq!(result.errors, 0);
        assert!(fx.store.list_wallet_addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chain_failure_for_one_wallet_does_not_sink_the_batch() {
        let now = chrono::Utc::now().timestamp();
        let mut fx = fixture_with(
            FakeChain::failing_for(&["0xbad"]),
            config(),
            vec![vec![
                api_trade("0xBAD", "tok-1", 7_000.0, now - 600),
                api_trade("0xAAA", "tok-2", 7_000.0, now - 600),
            ]],
        )
        .await;

        let result = run_scan(&mut fx.aggregator, &fx.engine, &fx.store, &fx.cfg, 50)
            .await
            .unwrap();

        assert_eq!(result.errors, 1);
        assert_eq!(result.suspicious_wallets, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].address, "0xbad");
        assert!(result.failures[0].reason.contains("indexer down"));
        assert!(fx.store.find_wallet_by_address("0xaaa").await.unwrap().is_some());
        assert!(fx.store.find_wallet_by_address("0xbad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_deadline_counts_queued_wallets_as_errors() {
        let now = chrono::Utc::now().timestamp();
        let mut cfg = config();
        cfg.scan.deadline_secs = 0;
        let batch: Vec<ApiTrade> = (0..5)
            .map(|i| api_trade(&format!("0xW{i}"), "tok-1", 10.0, now - 600 - i))
            .collect();
        let mut fx = fixture_with(FakeChain::fresh(), cfg, vec![batch]).await;

        let result = run_scan(&mut fx.aggregator, &fx.engine, &fx.store, &fx.cfg, 50)
            .await
            .unwrap();

        assert_eq!(result.processed_wallets, 0);
        assert_eq!(result.errors, 5);
        assert!(result
            .failures
            .iter()
            .all(|f| f.reason.contains("deadline exceeded")));
    }

    #[tokio::test]
    async fn test_all_sources_failing_is_fatal_for_the_cycle() {
        let mut fx = fixture_with(FakeChain::fresh(), config(), Vec::new()).await;
        // Empty queues mean every source yields zero valid trades.
        let err = run_scan(&mut fx.aggregator, &fx.engine, &fx.store, &fx.cfg, 50)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<UpstreamUnavailable>().is_some());
    }

    #[tokio::test]
    async fn test_market_volume_accumulates_across_flagged_wallets() {
        let now = chrono::Utc::now().timestamp();
        let mut fx = fixture_with(
            FakeChain::fresh(),
            config(),
            vec![vec![
                api_trade("0xAAA", "tok-1", 6_000.0, now - 600),
                api_trade("0xBBB", "tok-1", 9_000.0, now - 601),
            ]],
        )
        .await;

        let result = run_scan(&mut fx.aggregator, &fx.engine, &fx.store, &fx.cfg, 50)
            .await
            .unwrap();
        assert_eq!(result.suspicious_wallets, 2);

        let market = fx.store.find_market_by_id("tok-1").await.unwrap().unwrap();
        assert!((market.volume_usdc - 15_000.0).abs() < f64::EPSILON);
    }
}
