use std::sync::Arc;

use anyhow::Result;
use common::chain::ChainDataProvider;
use common::config::Config;
use common::polymarket::PolymarketClient;
use common::store::Store;
use common::types::{canonical_address, WalletTag, WinRateOutcome};

use crate::jobs;
use crate::risk_scoring::RiskScoringEngine;
use crate::trade_sources::TradeSourceAggregator;
use crate::win_rate::WinRateAggregator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Scan,
    Wallets,
    Wallet { address: String },
    WinRate { address: String },
    Star { address: String },
    Status,
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "scan" => Ok(Command::Scan),
        "wallets" => Ok(Command::Wallets),
        "wallet" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: scanner wallet <address>".to_string())?;
            Ok(Command::Wallet { address: canonical_address(&address) })
        }
        "winrate" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: scanner winrate <address>".to_string())?;
            Ok(Command::WinRate { address: canonical_address(&address) })
        }
        "star" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: scanner star <address>".to_string())?;
            Ok(Command::Star { address: canonical_address(&address) })
        }
        "status" => Ok(Command::Status),
        other => Err(format!("unknown command: {other}")),
    }
}

pub async fn run_command(
    cmd: Command,
    store: &Store,
    api: Arc<PolymarketClient>,
    chain: Arc<ChainDataProvider>,
    cfg: Arc<Config>,
) -> Result<()> {
    match cmd {
        Command::Run => Ok(()),
        Command::Scan => run_single_scan(store, api, chain, &cfg).await,
        Command::Wallets => show_wallets(store).await,
        Command::Wallet { address } => show_wallet(store, chain.as_ref(), &address).await,
        Command::WinRate { address } => compute_win_rate(store, api, cfg, &address).await,
        Command::Star { address } => toggle_star(store, &address).await,
        Command::Status => show_status(store).await,
    }
}

/// One foreground scan cycle with a fresh dedup set.
async fn run_single_scan(
    store: &Store,
    api: Arc<PolymarketClient>,
    chain: Arc<ChainDataProvider>,
    cfg: &Arc<Config>,
) -> Result<()> {
    let mut aggregator = TradeSourceAggregator::new(api, &cfg.sources)?;
    let engine = Arc::new(RiskScoringEngine::new(chain, store.clone(), cfg.clone()));
    let result = jobs::run_scan_once(&mut aggregator, &engine, store, cfg.as_ref()).await?;

    println!(
        "Scan complete: source={} trades={} wallets={} new={} suspicious={} skipped={} errors={}",
        result.source,
        result.total_trades,
        result.processed_wallets,
        result.new_wallets,
        result.suspicious_wallets,
        result.skipped_wallets,
        result.errors
    );
    for flagged in &result.flagged {
        println!("  flagged {}  score={}", flagged.address, flagged.score);
    }
    for failure in &result.failures {
        println!("  failed {}  {}", failure.address, failure.reason);
    }
    Ok(())
}

fn wallet_tags(is_suspicious: bool, is_high_win_rate: bool) -> String {
    let mut tags: Vec<&str> = Vec::new();
    if is_suspicious {
        tags.push(WalletTag::Suspicious.as_str());
    }
    if is_high_win_rate {
        tags.push(WalletTag::HighWinRate.as_str());
    }
    tags.join(",")
}

async fn show_wallets(store: &Store) -> Result<()> {
    println!("Flagged wallets:");
    for w in store.list_flagged_wallets(200).await? {
        let star = if w.is_starred { "*" } else { " " };
        println!(
            "{star} {}  score={}  tags=[{}]  last_active={}",
            w.address,
            w.risk_score,
            wallet_tags(w.is_suspicious, w.is_high_win_rate),
            w.last_active_at
        );
    }
    Ok(())
}

async fn show_wallet(store: &Store, chain: &ChainDataProvider, address: &str) -> Result<()> {
    println!("Wallet: {address}");

    match store.find_wallet_by_address(address).await? {
        Some(w) => {
            println!(
                "  risk_score={}  tags=[{}]  starred={}",
                w.risk_score,
                wallet_tags(w.is_suspicious, w.is_high_win_rate),
                w.is_starred
            );
            if let Some(funder) = &w.funding_source {
                println!("  funding_source={funder}");
            }
            if let Some(created) = w.wallet_created_at {
                println!("  wallet_created_at={created}");
            }
            println!("  first_seen={}  last_active={}", w.created_at, w.last_active_at);
        }
        None => println!("  (not in wallets table)"),
    }

    let markets = store.count_distinct_markets_for_wallet(address).await?;
    println!("  markets_traded={markets}");

    if let Some(rate) = store.find_win_rate(address).await? {
        let s = rate.summary;
        println!(
            "  win_rate={}% ({}W/{}L of {})  computed_at={}",
            s.win_rate_pct, s.winning, s.losing, s.total_positions, rate.computed_at
        );
    }

    // Live chain facts are best-effort; the stored record still prints
    // when the RPC is down.
    match chain.native_balance(address).await {
        Ok(balance) => println!("  native_balance={balance:.4}"),
        Err(e) => tracing::warn!(wallet = %address, error = %e, "balance lookup failed"),
    }
    match chain.native_nonce(address).await {
        Ok(nonce) => println!("  native_nonce={nonce}"),
        Err(e) => tracing::warn!(wallet = %address, error = %e, "nonce lookup failed"),
    }

    Ok(())
}

async fn compute_win_rate(
    store: &Store,
    api: Arc<PolymarketClient>,
    cfg: Arc<Config>,
    address: &str,
) -> Result<()> {
    let min_sample = cfg.win_rate.min_sample;
    let aggregator = WinRateAggregator::new(api, cfg);
    match aggregator.compute(address).await? {
        WinRateOutcome::Computed(summary) => {
            store.upsert_win_rate(address, summary).await?;
            println!(
                "Win rate for {address}: {}% ({}W/{}L of {})  total_profit={:.2}  avg_profit={:.2}",
                summary.win_rate_pct,
                summary.winning,
                summary.losing,
                summary.total_positions,
                summary.total_profit,
                summary.avg_profit
            );
        }
        WinRateOutcome::NotEnoughData { valid_positions } => {
            println!(
                "Not enough closed positions for {address}: {valid_positions} valid, need {min_sample}"
            );
        }
    }
    Ok(())
}

async fn toggle_star(store: &Store, address: &str) -> Result<()> {
    match store.toggle_wallet_star(address).await? {
        Some(true) => println!("Starred {address}"),
        Some(false) => println!("Unstarred {address}"),
        None => println!("No wallet {address} in the store"),
    }
    Ok(())
}

async fn show_status(store: &Store) -> Result<()> {
    println!("Job status:");
    for job in store.list_job_statuses().await? {
        println!(
            "{:<18} {:<8} last_run={}  duration_ms={}  error={}",
            job.job_name,
            job.status,
            job.last_run_at.as_deref().unwrap_or("-"),
            job.duration_ms.map_or_else(|| "-".to_string(), |ms| ms.to_string()),
            job.last_error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
