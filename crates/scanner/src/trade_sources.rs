//! Priority-ordered trade ingestion across the venue's three feeds.
//!
//! Sources are tried in configured order and the first one that decodes at
//! least one valid trade wins the cycle; batches from different sources are
//! never combined. Each source has its own wire shape, decoded here into
//! the common [`Trade`] before anything downstream sees it.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use common::config;
use common::polymarket::classify_api_error;
use common::types::{canonical_address, ApiActivity, ApiTrade, IndexFill, Trade, TradeKey};
use tracing::{debug, warn};

use crate::jobs::TradeFetch;

/// Upstream source of recent venue trades, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    DataApi,
    Activity,
    Index,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataApi => "data_api",
            Self::Activity => "activity",
            Self::Index => "index",
        }
    }

    fn parse(name: &str) -> Result<Self> {
        match name {
            "data_api" => Ok(Self::DataApi),
            "activity" => Ok(Self::Activity),
            "index" => Ok(Self::Index),
            other => anyhow::bail!("unknown trade source {other:?} in sources.priority"),
        }
    }
}

/// Every configured source failed to yield a usable batch.
#[derive(Debug, thiserror::Error)]
#[error("all trade sources failed: {}", format_failures(.failures))]
pub struct UpstreamUnavailable {
    pub failures: Vec<SourceFailure>,
}

#[derive(Debug, Clone)]
pub struct SourceFailure {
    pub source: SourceKind,
    pub reason: String,
}

fn format_failures(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.source.as_str(), f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One successful fetch: the trades that survived dedup plus the per-batch
/// drop counts.
#[derive(Debug)]
pub struct FetchedTrades {
    pub source: SourceKind,
    pub trades: Vec<Trade>,
    pub malformed: usize,
    pub duplicates: usize,
}

/// Trade fetcher with retries, source fallback and process-lifetime dedup.
///
/// The seen-set lives as long as the aggregator, so a daemon that keeps one
/// aggregator per worker never hands out the same trade twice.
pub struct TradeSourceAggregator<F> {
    fetcher: F,
    priority: Vec<SourceKind>,
    max_retries: u32,
    backoff_base: Duration,
    seen: HashSet<TradeKey>,
}

impl<F: TradeFetch + Sync> TradeSourceAggregator<F> {
    pub fn new(fetcher: F, cfg: &config::Sources) -> Result<Self> {
        let priority = cfg
            .priority
            .iter()
            .map(|name| SourceKind::parse(name))
            .collect::<Result<Vec<_>>>()?;
        anyhow::ensure!(!priority.is_empty(), "sources.priority must not be empty");
        Ok(Self {
            fetcher,
            priority,
            max_retries: cfg.max_retries,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            seen: HashSet::new(),
        })
    }

    /// Fetch one batch of recent trades from the first usable source.
    ///
    /// A source that decodes zero valid trades counts as failed and the
    /// next one is consulted. Dedup runs after a source wins, so the
    /// returned batch can be empty when every decoded trade was already
    /// seen earlier in this process.
    pub async fn fetch_trades(
        &mut self,
        limit: u32,
    ) -> std::result::Result<FetchedTrades, UpstreamUnavailable> {
        let mut failures = Vec::new();
        for source in self.priority.clone() {
            match self.fetch_source_with_retries(source, limit).await {
                Ok((decoded, malformed)) => {
                    if malformed > 0 {
                        warn!(source = source.as_str(), malformed, "dropped malformed trade records");
                        metrics::counter!("scanner_trades_malformed_total", "source" => source.as_str())
                            .increment(malformed as u64);
                    }
                    if decoded.is_empty() {
                        debug!(source = source.as_str(), "no valid trades in response, trying next source");
                        failures.push(SourceFailure {
                            source,
                            reason: "no valid trades in response".to_string(),
                        });
                        continue;
                    }
                    let decoded_len = decoded.len();
                    let trades: Vec<Trade> = decoded
                        .into_iter()
                        .filter(|t| self.seen.insert(t.identity()))
                        .collect();
                    let duplicates = decoded_len - trades.len();
                    metrics::counter!("scanner_trades_fetched_total", "source" => source.as_str())
                        .increment(trades.len() as u64);
                    if duplicates > 0 {
                        metrics::counter!("scanner_trades_deduped_total", "source" => source.as_str())
                            .increment(duplicates as u64);
                    }
                    metrics::gauge!("scanner_dedup_seen_size").set(self.seen.len() as f64);
                    debug!(
                        source = source.as_str(),
                        fetched = trades.len(),
                        duplicates,
                        malformed,
                        "trade batch ready"
                    );
                    return Ok(FetchedTrades { source, trades, malformed, duplicates });
                }
                Err(reason) => {
                    metrics::counter!("scanner_source_failures_total", "source" => source.as_str())
                        .increment(1);
                    failures.push(SourceFailure { source, reason });
                }
            }
        }
        Err(UpstreamUnavailable { failures })
    }

    /// Forget every trade identity seen so far.
    pub fn reset_seen(&mut self) {
        self.seen.clear();
        metrics::gauge!("scanner_dedup_seen_size").set(0.0);
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    async fn fetch_source_with_retries(
        &self,
        source: SourceKind,
        limit: u32,
    ) -> std::result::Result<(Vec<Trade>, usize), String> {
        let mut last_reason = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.backoff_base * 2_u32.pow(attempt - 1);
                debug!(
                    source = source.as_str(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying source after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            match self.fetch_source(source, limit).await {
                Ok(batch) => return Ok(batch),
                Err(e) => {
                    let kind = classify_api_error(&e);
                    warn!(
                        source = source.as_str(),
                        attempt,
                        kind = kind.as_str(),
                        error = %e,
                        "trade source request failed"
                    );
                    last_reason = format!("{e:#}");
                    if !kind.is_transient() {
                        break;
                    }
                }
            }
        }
        Err(last_reason)
    }

    async fn fetch_source(&self, source: SourceKind, limit: u32) -> Result<(Vec<Trade>, usize)> {
        match source {
            SourceKind::DataApi => Ok(decode_data_api(self.fetcher.data_api_trades(limit).await?)),
            SourceKind::Activity => Ok(decode_activity(self.fetcher.activity_trades(limit).await?)),
            SourceKind::Index => Ok(decode_index(self.fetcher.index_fill_trades(limit).await?)),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Shared validation for all three shapes. Maker and asset must be present,
/// the amount finite and positive, the timestamp a positive epoch.
fn build_trade(
    maker: Option<String>,
    asset: Option<String>,
    amount: f64,
    timestamp: i64,
    side: Option<String>,
    title: Option<String>,
) -> Option<Trade> {
    let maker_address = canonical_address(&non_empty(maker)?);
    let asset_id = non_empty(asset)?;
    if !amount.is_finite() || amount <= 0.0 || timestamp <= 0 {
        return None;
    }
    Some(Trade {
        maker_address,
        asset_id,
        amount_usdc: amount,
        timestamp,
        side: non_empty(side),
        title,
    })
}

/// The `/trades` feed: string `size` and `price` to multiply, unix-second
/// timestamps.
fn decode_data_api(records: Vec<ApiTrade>) -> (Vec<Trade>, usize) {
    let total = records.len();
    let trades: Vec<Trade> = records
        .into_iter()
        .filter_map(|record| {
            let size: f64 = record.size?.parse().ok()?;
            let price: f64 = record.price?.parse().ok()?;
            build_trade(
                record.proxy_wallet,
                record.asset,
                size * price,
                record.timestamp?,
                record.side,
                record.title,
            )
        })
        .collect();
    let malformed = total - trades.len();
    (trades, malformed)
}

/// The `/activity` feed: pre-multiplied `usdcSize`, unix-millisecond
/// timestamps. Rows of any non-trade activity type are dropped.
fn decode_activity(records: Vec<ApiActivity>) -> (Vec<Trade>, usize) {
    let total = records.len();
    let trades: Vec<Trade> = records
        .into_iter()
        .filter_map(|record| {
            if record
                .activity_type
                .as_deref()
                .is_some_and(|t| !t.eq_ignore_ascii_case("TRADE"))
            {
                return None;
            }
            let amount: f64 = record.usdc_size?.parse().ok()?;
            let millis = record.timestamp?;
            build_trade(
                record.proxy_wallet,
                record.asset,
                amount,
                millis / 1000,
                record.side,
                record.title,
            )
        })
        .collect();
    let malformed = total - trades.len();
    (trades, malformed)
}

/// The index subgraph fills: decimal-string amounts, ISO-8601 timestamps.
fn decode_index(records: Vec<IndexFill>) -> (Vec<Trade>, usize) {
    let total = records.len();
    let trades: Vec<Trade> = records
        .into_iter()
        .filter_map(|record| {
            let amount: f64 = record.amount?.parse().ok()?;
            let ts = chrono::DateTime::parse_from_rfc3339(&record.timestamp?)
                .ok()?
                .timestamp();
            build_trade(record.maker, record.asset_id, amount, ts, record.side, None)
        })
        .collect();
    let malformed = total - trades.len();
    (trades, malformed)
}
