use anyhow::{Context, Result};
use serde::Deserialize;
use std::str::FromStr;

pub const DEFAULT_PATH: &str = "config/default.toml";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub scan: Scan,
    pub risk: Risk,
    pub win_rate: WinRate,
    pub sources: Sources,
    pub chain: Chain,
    pub observability: Observability,
}

#[derive(Debug, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Database {
    pub path: String,
    pub checkpoint_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Scan {
    pub batch_limit: u32,
    pub concurrency: usize,
    pub interval_secs: u64,
    /// Wall-clock limit for one cycle's worker pool. Wallets still queued
    /// at expiry are counted as errors, finished work is kept.
    pub deadline_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Risk {
    /// Cost gate: wallets whose largest cycle trade is below this are not
    /// scored at all.
    pub min_trade_amount_usdc: f64,
    pub large_trade_amount_usdc: f64,
    pub young_wallet_hours: f64,
    pub low_activity_tx_count: u32,
    pub min_market_count: u32,
    pub creation_gap_max_pct: f64,
    pub recent_trade_hours: f64,
}

#[derive(Debug, Deserialize)]
pub struct WinRate {
    pub threshold_pct: f64,
    pub max_positions: u32,
    pub page_size: u32,
    pub min_sample: u32,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Sources {
    /// Priority order of trade sources; first usable source wins.
    pub priority: Vec<String>,
    pub data_api_url: String,
    pub index_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub rate_limit_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct Chain {
    pub transfers_api_url: String,
    pub rpc_url: String,
    /// Hard-fail when the transfers index contradicts chain state instead
    /// of substituting an estimate. Relaxing this changes what a risk score
    /// means; keep it on in production.
    pub verification_mode: bool,
    pub request_timeout_secs: u64,
    pub transfer_count_cap: u32,
}

#[derive(Debug, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        let raw = std::fs::read_to_string(DEFAULT_PATH)
            .with_context(|| format!("reading {DEFAULT_PATH}"))?;
        raw.parse()
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}
