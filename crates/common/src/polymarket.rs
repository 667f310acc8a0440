use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config;
use crate::types::{ApiActivity, ApiClosedPosition, ApiTrade, IndexFill};

/// Non-2xx reply from an upstream API. Kept as a typed error so callers can
/// classify by status code after the anyhow context wrapping.
#[derive(Debug, thiserror::Error)]
#[error("{endpoint} returned {status}: {body}")]
pub struct ApiStatusError {
    pub endpoint: &'static str,
    pub status: u16,
    pub body: String,
}

/// Coarse failure category for metrics labels and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    Timeout,
    Connect,
    RateLimited,
    Server,
    Decode,
    Other,
}

impl ApiErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Decode => "decode",
            Self::Other => "other",
        }
    }

    /// Transient failures are worth retrying against the same source before
    /// falling through to the next one.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connect | Self::RateLimited | Self::Server
        )
    }
}

/// Walk an anyhow chain and classify the underlying API failure.
pub fn classify_api_error(err: &anyhow::Error) -> ApiErrorKind {
    for cause in err.chain() {
        if let Some(status_err) = cause.downcast_ref::<ApiStatusError>() {
            if status_err.status == 429 {
                return ApiErrorKind::RateLimited;
            }
            if status_err.status >= 500 {
                return ApiErrorKind::Server;
            }
            return ApiErrorKind::Other;
        }
        if let Some(req_err) = cause.downcast_ref::<reqwest::Error>() {
            if req_err.is_timeout() {
                return ApiErrorKind::Timeout;
            }
            if req_err.is_connect() {
                return ApiErrorKind::Connect;
            }
            if req_err.is_decode() {
                return ApiErrorKind::Decode;
            }
        }
    }
    ApiErrorKind::Other
}

#[derive(Debug, Deserialize)]
struct IndexFillsReply {
    data: Option<IndexFillsData>,
    errors: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct IndexFillsData {
    fills: Vec<IndexFill>,
}

/// Thin client over the venue's trade/activity/positions APIs and the
/// decentralized-index GraphQL endpoint. Retries and metrics live with the
/// callers; this only fetches and decodes.
pub struct PolymarketClient {
    data_api_url: String,
    index_url: String,
    client: reqwest::Client,
    rate_limit_delay: Duration,
}

impl PolymarketClient {
    pub fn new(cfg: &config::Sources) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("failed to build API HTTP client")?;

        Ok(Self {
            data_api_url: cfg.data_api_url.trim_end_matches('/').to_string(),
            index_url: cfg.index_url.trim_end_matches('/').to_string(),
            client,
            rate_limit_delay: Duration::from_millis(cfg.rate_limit_delay_ms),
        })
    }

    pub fn recent_trades_url(&self, limit: u32) -> String {
        format!("{}/trades?limit={limit}&takerOnly=false", self.data_api_url)
    }

    pub fn recent_activity_url(&self, limit: u32) -> String {
        format!("{}/activity?limit={limit}&type=TRADE", self.data_api_url)
    }

    pub fn closed_positions_url(&self, user: &str, limit: u32, offset: u32) -> String {
        let encoded_user = urlencoding::encode(user);
        format!(
            "{}/positions?user={encoded_user}&closed=true&limit={limit}&offset={offset}",
            self.data_api_url
        )
    }

    /// Venue-wide recent trades from the Data API `/trades` feed.
    pub async fn fetch_recent_trades(&self, limit: u32) -> Result<Vec<ApiTrade>> {
        let url = self.recent_trades_url(limit);
        self.get_json("data_api_trades", &url).await
    }

    /// Venue-wide recent activity from the Data API `/activity` feed.
    pub async fn fetch_recent_activity(&self, limit: u32) -> Result<Vec<ApiActivity>> {
        let url = self.recent_activity_url(limit);
        self.get_json("data_api_activity", &url).await
    }

    /// One page of a wallet's settled positions.
    pub async fn fetch_closed_positions(
        &self,
        user: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ApiClosedPosition>> {
        let url = self.closed_positions_url(user, limit, offset);
        self.get_json("closed_positions", &url).await
    }

    /// Recent fills from the decentralized index, newest first.
    pub async fn fetch_index_fills(&self, limit: u32) -> Result<Vec<IndexFill>> {
        let query = format!(
            "{{ fills(first: {limit}, orderBy: timestamp, orderDirection: desc) \
             {{ maker assetId amount timestamp side }} }}"
        );
        let body = serde_json::json!({ "query": query });

        debug!(url = %self.index_url, "fetching index fills");
        tokio::time::sleep(self.rate_limit_delay).await;

        let resp = self
            .client
            .post(&self.index_url)
            .json(&body)
            .send()
            .await
            .context("request to index_fills failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                warn!(endpoint = "index_fills", "rate limited, caller should back off");
            }
            return Err(ApiStatusError {
                endpoint: "index_fills",
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let reply: IndexFillsReply = resp
            .json()
            .await
            .context("failed to deserialize index_fills response")?;
        if let Some(errors) = reply.errors {
            if !errors.is_empty() {
                anyhow::bail!("index query failed: {}", serde_json::Value::Array(errors));
            }
        }
        let fills = reply.data.map(|d| d.fills).unwrap_or_default();
        debug!(count = fills.len(), "fetched index fills");
        Ok(fills)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &'static str,
        url: &str,
    ) -> Result<T> {
        debug!(url = %url, "fetching");

        // Rate limiting
        tokio::time::sleep(self.rate_limit_delay).await;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {endpoint} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                warn!(endpoint = endpoint, "rate limited, caller should back off");
            }
            return Err(ApiStatusError {
                endpoint,
                status: status.as_u16(),
                body,
            }
            .into());
        }

        resp.json()
            .await
            .with_context(|| format!("failed to deserialize {endpoint} response"))
    }
}
