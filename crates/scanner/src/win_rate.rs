//! Win/loss aggregation over a wallet's closed positions.
//!
//! Positions are paged in until the cap or an early-exit floor is reached.
//! Zero-P&L ties and unparseable rows never count toward either side of
//! the rate.

use std::sync::Arc;

use anyhow::Result;
use common::config::Config;
use common::types::{ClosedPosition, WinRateOutcome, WinRateSummary};
use tracing::debug;

use crate::jobs::PositionsPager;

/// Pagination stops once this many valid positions are in hand, or half
/// the configured position cap, whichever is larger.
const EARLY_EXIT_FLOOR: u32 = 50;

pub struct WinRateAggregator<P> {
    api: Arc<P>,
    cfg: Arc<Config>,
}

impl<P: PositionsPager + Send + Sync> WinRateAggregator<P> {
    pub fn new(api: Arc<P>, cfg: Arc<Config>) -> Self {
        Self { api, cfg }
    }

    /// Compute the wallet's win rate, or `NotEnoughData` when fewer valid
    /// positions exist than the sample floor.
    pub async fn compute(&self, address: &str) -> Result<WinRateOutcome> {
        let page_size = self.cfg.win_rate.page_size;
        let cap = self.cfg.win_rate.max_positions;
        let target = EARLY_EXIT_FLOOR.max(cap / 2);

        let mut valid: Vec<ClosedPosition> = Vec::new();
        let mut fetched: u32 = 0;
        let mut ties: u32 = 0;
        let mut malformed: u32 = 0;
        let mut offset: u32 = 0;

        loop {
            debug!(url = %self.api.positions_url(address, page_size, offset), "fetching closed positions page");
            let page = self.api.closed_positions_page(address, page_size, offset).await?;
            let page_len = u32::try_from(page.len()).unwrap_or(u32::MAX);
            fetched = fetched.saturating_add(page_len);

            for position in page {
                match position.realized_pnl.as_deref().and_then(|raw| raw.parse::<f64>().ok()) {
                    Some(pnl) if pnl.is_finite() => {
                        if pnl.abs() < f64::EPSILON {
                            ties += 1;
                        } else {
                            valid.push(ClosedPosition { realized_pnl: pnl });
                        }
                    }
                    _ => malformed += 1,
                }
            }

            let enough = u32::try_from(valid.len()).unwrap_or(u32::MAX) >= target;
            if page_len < page_size || fetched >= cap || enough {
                break;
            }
            offset += page_len;
        }

        debug!(
            wallet = %address,
            fetched,
            valid = valid.len(),
            ties,
            malformed,
            "closed positions collected"
        );
        Ok(reduce_positions(&valid, self.cfg.win_rate.min_sample))
    }
}

/// Reduce valid (non-tie) positions into a summary, or `NotEnoughData`
/// below the sample floor.
pub fn reduce_positions(valid: &[ClosedPosition], min_sample: u32) -> WinRateOutcome {
    let total = u32::try_from(valid.len()).unwrap_or(u32::MAX);
    if total < min_sample {
        return WinRateOutcome::NotEnoughData { valid_positions: total };
    }

    let winning = u32::try_from(valid.iter().filter(|p| p.realized_pnl > 0.0).count())
        .unwrap_or(u32::MAX);
    let losing = total - winning;
    let total_profit: f64 = valid.iter().map(|p| p.realized_pnl).sum();

    WinRateOutcome::Computed(WinRateSummary {
        total_positions: total,
        winning,
        losing,
        win_rate_pct: round2(f64::from(winning) / f64::from(winning + losing) * 100.0),
        total_profit,
        avg_profit: total_profit / f64::from(total),
    })
}

/// High win rate iff the computed rate meets the configured threshold.
pub fn is_high_win_rate(summary: &WinRateSummary, threshold_pct: f64) -> bool {
    summary.win_rate_pct >= threshold_pct
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
