use serde::{Deserialize, Serialize};

/// Canonical form of a wallet address: trimmed and lowercased.
///
/// Every address crossing a component boundary is canonicalized exactly once
/// at the decode/input edge; everything downstream compares and stores this
/// form.
pub fn canonical_address(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// One observed market transaction, normalized from whichever upstream
/// source reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub maker_address: String,
    pub asset_id: String,
    pub amount_usdc: f64,
    /// Unix epoch seconds.
    pub timestamp: i64,
    pub side: Option<String>,
    pub title: Option<String>,
}

impl Trade {
    /// Identity for dedup. Two records with the same timestamp, maker and
    /// asset are the same trade no matter which source reported them.
    pub fn identity(&self) -> TradeKey {
        TradeKey {
            timestamp: self.timestamp,
            maker_address: self.maker_address.clone(),
            asset_id: self.asset_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TradeKey {
    pub timestamp: i64,
    pub maker_address: String,
    pub asset_id: String,
}

/// Classification tags a wallet can carry. A wallet may hold both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletTag {
    Suspicious,
    HighWinRate,
}

impl WalletTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suspicious => "suspicious",
            Self::HighWinRate => "high_win_rate",
        }
    }
}

/// A settled position with realized profit or loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedPosition {
    pub realized_pnl: f64,
}

/// Win/loss reduction over a wallet's closed positions. Zero-P&L ties are
/// excluded from every field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WinRateSummary {
    pub total_positions: u32,
    pub winning: u32,
    pub losing: u32,
    pub win_rate_pct: f64,
    pub total_profit: f64,
    pub avg_profit: f64,
}

/// Outcome of a win-rate aggregation. A small sample is a defined
/// no-opinion result, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WinRateOutcome {
    Computed(WinRateSummary),
    NotEnoughData { valid_positions: u32 },
}

/// Trade from the Data API `/trades` feed. Amount is `size * price`;
/// timestamps are unix epoch seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiTrade {
    #[serde(rename = "proxyWallet", alias = "proxy_wallet")]
    pub proxy_wallet: Option<String>,
    pub asset: Option<String>,
    #[serde(rename = "conditionId", alias = "condition_id")]
    pub condition_id: Option<String>,
    #[serde(deserialize_with = "de_opt_string_any", default)]
    pub size: Option<String>,
    #[serde(deserialize_with = "de_opt_string_any", default)]
    pub price: Option<String>,
    pub timestamp: Option<i64>,
    pub side: Option<String>,
    pub title: Option<String>,
}

/// Record from the Data API `/activity` feed. Amount arrives pre-multiplied
/// as `usdcSize`; timestamps are unix epoch milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiActivity {
    #[serde(rename = "proxyWallet", alias = "proxy_wallet")]
    pub proxy_wallet: Option<String>,
    pub asset: Option<String>,
    #[serde(rename = "conditionId", alias = "condition_id")]
    pub condition_id: Option<String>,
    #[serde(rename = "type")]
    pub activity_type: Option<String>,
    #[serde(rename = "usdcSize", deserialize_with = "de_opt_string_any", default)]
    pub usdc_size: Option<String>,
    pub timestamp: Option<i64>,
    pub side: Option<String>,
    pub title: Option<String>,
}

/// Fill row from the decentralized-index fallback. Amount arrives as a
/// decimal string; timestamps are ISO-8601 strings.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexFill {
    pub maker: Option<String>,
    #[serde(rename = "assetId", alias = "asset_id")]
    pub asset_id: Option<String>,
    #[serde(deserialize_with = "de_opt_string_any", default)]
    pub amount: Option<String>,
    pub timestamp: Option<String>,
    pub side: Option<String>,
}

/// Closed position from the Data API `/positions` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiClosedPosition {
    #[serde(rename = "proxyWallet", alias = "proxy_wallet")]
    pub proxy_wallet: Option<String>,
    #[serde(rename = "conditionId", alias = "condition_id")]
    pub condition_id: Option<String>,
    #[serde(rename = "realizedPnl", deserialize_with = "de_opt_string_any", default)]
    pub realized_pnl: Option<String>,
    pub title: Option<String>,
}

/// Deserialize a field that can be either a string or a number into
/// `Option<String>`. The Data API is inconsistent about numeric fields.
pub fn de_opt_string_any<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct StringOrNumber;

    impl<'de> de::Visitor<'de> for StringOrNumber {
        type Value = Option<String>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a string or number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(StringOrNumber)
}
