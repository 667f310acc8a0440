//! Multi-signal risk scoring for wallets not yet in the store.
//!
//! The expensive chain lookups only run for wallets whose largest trade in
//! the cycle clears the amount gate. Score arithmetic is kept pure in
//! [`evaluate_checks`] so the boundary behavior is directly testable.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use common::config::{self, Config};
use common::store::Store;
use common::types::Trade;
use tracing::{debug, warn};

use crate::jobs::ChainData;

/// Score at or above which a wallet is flagged suspicious. Part of the
/// scoring contract, deliberately not configurable.
pub const SUSPICION_THRESHOLD: u32 = 50;

const YOUNG_WALLET_POINTS: u32 = 50;
const LOW_ACTIVITY_POINTS: u32 = 30;
const LOW_PARTICIPATION_POINTS: u32 = 20;
const LARGE_TRADE_POINTS: u32 = 10;
const CREATION_GAP_POINTS: u32 = 15;
const RECENT_TRADE_POINTS: u32 = 10;

/// Outcome of one check: whether it fired, the points it contributed, and
/// the raw metric that drove the decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckResult {
    pub passed: bool,
    pub score: u32,
    pub raw_metric: f64,
}

impl CheckResult {
    fn fired(points: u32, raw_metric: f64) -> Self {
        Self { passed: true, score: points, raw_metric }
    }

    fn clear(raw_metric: f64) -> Self {
        Self { passed: false, score: 0, raw_metric }
    }
}

/// Per-check results for one scored wallet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub wallet_age: CheckResult,
    pub transaction_count: CheckResult,
    pub market_participation: CheckResult,
    pub single_trade_amount: CheckResult,
    pub creation_gap: CheckResult,
    pub trade_recency: CheckResult,
}

impl ScoreBreakdown {
    /// Exact sum of the six check scores, never clamped.
    pub fn total(&self) -> u32 {
        self.wallet_age.score
            + self.transaction_count.score
            + self.market_participation.score
            + self.single_trade_amount.score
            + self.creation_gap.score
            + self.trade_recency.score
    }
}

/// Everything the six checks need, gathered up front so the arithmetic
/// itself has no I/O.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs {
    pub now_epoch: i64,
    pub first_activity_epoch: i64,
    pub tx_count: u32,
    /// None when the market lookup failed; the check degrades to 0 points.
    pub market_count: Option<u32>,
    pub max_trade_amount: f64,
    pub first_trade_epoch: i64,
    pub qualifying_trade_epoch: i64,
}

/// Run the six checks. All thresholds are strict comparisons.
pub fn evaluate_checks(cfg: &config::Risk, inputs: RiskInputs) -> ScoreBreakdown {
    let age_hours = (inputs.now_epoch - inputs.first_activity_epoch) as f64 / 3600.0;
    let wallet_age = if age_hours < cfg.young_wallet_hours {
        CheckResult::fired(YOUNG_WALLET_POINTS, age_hours)
    } else {
        CheckResult::clear(age_hours)
    };

    let transaction_count = if inputs.tx_count < cfg.low_activity_tx_count {
        CheckResult::fired(LOW_ACTIVITY_POINTS, f64::from(inputs.tx_count))
    } else {
        CheckResult::clear(f64::from(inputs.tx_count))
    };

    let market_participation = match inputs.market_count {
        Some(count) if count < cfg.min_market_count => {
            CheckResult::fired(LOW_PARTICIPATION_POINTS, f64::from(count))
        }
        Some(count) => CheckResult::clear(f64::from(count)),
        None => CheckResult::clear(-1.0),
    };

    let single_trade_amount = if inputs.max_trade_amount > cfg.large_trade_amount_usdc {
        CheckResult::fired(LARGE_TRADE_POINTS, inputs.max_trade_amount)
    } else {
        CheckResult::clear(inputs.max_trade_amount)
    };

    let creation_gap = creation_gap_check(cfg, inputs);

    let recency_hours = (inputs.now_epoch - inputs.qualifying_trade_epoch) as f64 / 3600.0;
    let trade_recency = if recency_hours < cfg.recent_trade_hours {
        CheckResult::fired(RECENT_TRADE_POINTS, recency_hours)
    } else {
        CheckResult::clear(recency_hours)
    };

    ScoreBreakdown {
        wallet_age,
        transaction_count,
        market_participation,
        single_trade_amount,
        creation_gap,
        trade_recency,
    }
}

/// Gap between wallet creation and its first observed trade, as a share of
/// the wallet's lifetime. A small gap means the wallet started trading
/// almost immediately after it was created.
fn creation_gap_check(cfg: &config::Risk, inputs: RiskInputs) -> CheckResult {
    let lifetime = inputs.now_epoch - inputs.first_activity_epoch;
    if lifetime <= 0 {
        // Zero-lifetime wallet, the gap is degenerate and maximally tight.
        return CheckResult::fired(CREATION_GAP_POINTS, 0.0);
    }
    let gap_pct =
        (inputs.first_trade_epoch - inputs.first_activity_epoch) as f64 / lifetime as f64 * 100.0;
    if gap_pct < cfg.creation_gap_max_pct {
        CheckResult::fired(CREATION_GAP_POINTS, gap_pct)
    } else {
        CheckResult::clear(gap_pct)
    }
}

/// A scored wallet. `wallet_created_at` and `funding_source` feed the
/// persisted record; `qualifying_trade` is the cycle's largest trade, kept
/// for the trade event write.
#[derive(Debug, Clone)]
pub struct RiskVerdict {
    pub score: u32,
    pub is_suspicious: bool,
    pub breakdown: ScoreBreakdown,
    pub wallet_created_at: i64,
    pub funding_source: Option<String>,
    pub qualifying_trade: Trade,
}

/// Why a wallet did or did not get a full scoring pass.
#[derive(Debug, Clone)]
pub enum ScoreOutcome {
    /// Largest cycle trade under the configured minimum; no lookups made.
    BelowGate { max_trade_amount: f64 },
    Scored(RiskVerdict),
}

pub struct RiskScoringEngine<C> {
    chain: Arc<C>,
    store: Store,
    cfg: Arc<Config>,
}

impl<C: ChainData + Send + Sync> RiskScoringEngine<C> {
    pub fn new(chain: Arc<C>, store: Store, cfg: Arc<Config>) -> Self {
        Self { chain, store, cfg }
    }

    /// Score one unseen wallet against its trades from the current cycle.
    ///
    /// The amount gate runs before any lookup. A failed chain lookup aborts
    /// the wallet with an error; a failed market lookup only degrades that
    /// one check to zero points.
    pub async fn score(&self, address: &str, cycle_trades: &[Trade]) -> Result<ScoreOutcome> {
        let qualifying = cycle_trades
            .iter()
            .max_by(|a, b| a.amount_usdc.total_cmp(&b.amount_usdc))
            .context("cannot score a wallet with no trades in the cycle")?;
        let max_trade_amount = qualifying.amount_usdc;

        if max_trade_amount < self.cfg.risk.min_trade_amount_usdc {
            debug!(wallet = %address, amount = max_trade_amount, "below amount gate, not scoring");
            return Ok(ScoreOutcome::BelowGate { max_trade_amount });
        }

        let first_activity = self.chain.first_activity(address).await?;
        let activity = self.chain.transaction_count(address).await?;
        let market_count = self.total_market_count(address, cycle_trades).await;

        let first_trade_epoch = cycle_trades
            .iter()
            .map(|t| t.timestamp)
            .min()
            .unwrap_or(qualifying.timestamp);

        let inputs = RiskInputs {
            now_epoch: chrono::Utc::now().timestamp(),
            first_activity_epoch: first_activity.epoch,
            tx_count: activity.count,
            market_count,
            max_trade_amount,
            first_trade_epoch,
            qualifying_trade_epoch: qualifying.timestamp,
        };
        let breakdown = evaluate_checks(&self.cfg.risk, inputs);
        let score = breakdown.total();
        debug!(
            wallet = %address,
            score,
            tx_count = activity.count,
            suspicious = score >= SUSPICION_THRESHOLD,
            "wallet scored"
        );

        Ok(ScoreOutcome::Scored(RiskVerdict {
            score,
            is_suspicious: score >= SUSPICION_THRESHOLD,
            breakdown,
            wallet_created_at: first_activity.epoch,
            funding_source: first_activity.funder,
            qualifying_trade: qualifying.clone(),
        }))
    }

    /// Distinct markets across persisted history and this cycle, counted as
    /// a union so a market present in both is one.
    async fn total_market_count(&self, address: &str, cycle_trades: &[Trade]) -> Option<u32> {
        match self.store.list_markets_for_wallet(address).await {
            Ok(known) => {
                let mut markets: HashSet<&str> = known.iter().map(String::as_str).collect();
                for trade in cycle_trades {
                    markets.insert(trade.asset_id.as_str());
                }
                Some(u32::try_from(markets.len()).unwrap_or(u32::MAX))
            }
            Err(e) => {
                warn!(wallet = %address, error = %e, "market participation lookup failed, check degrades to zero");
                None
            }
        }
    }
}
