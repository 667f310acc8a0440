use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config;

/// Chain lookups for one wallet failed or contradicted each other. Fatal to
/// scoring that wallet only, never to the batch.
#[derive(Debug, thiserror::Error)]
#[error("chain data unavailable for {address}: {reason}")]
pub struct ChainDataUnavailable {
    pub address: String,
    pub reason: String,
}

/// Earliest observed on-chain activity for a wallet. When that activity is a
/// received transfer, `funder` carries the counterparty that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstActivity {
    /// Unix epoch seconds.
    pub epoch: i64,
    pub funder: Option<String>,
}

/// Outbound transfer count from the indexer. `capped` means the indexer page
/// was full, so the true count is "count or more".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferActivity {
    pub count: u32,
    pub capped: bool,
}

impl std::fmt::Display for TransferActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.capped {
            write!(f, "{}+", self.count)
        } else {
            write!(f, "{}", self.count)
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    result: Option<serde_json::Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct TransfersPage {
    transfers: Vec<RawTransfer>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransfer {
    from: Option<String>,
    block_num: Option<String>,
    metadata: Option<TransferMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferMetadata {
    block_timestamp: Option<String>,
}

#[derive(Clone, Copy)]
enum Direction {
    Sent,
    Received,
}

/// On-chain history lookups: first activity time and outbound transaction
/// count. Uses an indexer for transfer history and a plain RPC node for
/// nonce/balance/block queries, falling back between them.
pub struct ChainDataProvider {
    transfers_api_url: String,
    rpc_url: String,
    client: reqwest::Client,
    verification_mode: bool,
    transfer_count_cap: u32,
}

impl ChainDataProvider {
    pub fn new(cfg: &config::Chain) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("failed to build chain HTTP client")?;

        Ok(Self {
            transfers_api_url: cfg.transfers_api_url.trim_end_matches('/').to_string(),
            rpc_url: cfg.rpc_url.trim_end_matches('/').to_string(),
            client,
            verification_mode: cfg.verification_mode,
            transfer_count_cap: cfg.transfer_count_cap,
        })
    }

    /// Earliest on-chain activity for the wallet.
    ///
    /// Tries the earliest sent transfer first, then the earliest received
    /// one (whose sender is reported as the funder). If the indexer has
    /// nothing, the account nonce decides: nonce 0 means a genuinely fresh
    /// wallet and "now" is the conservative creation time; a non-zero nonce
    /// means the indexer is contradicting chain state, which under
    /// verification mode is a hard failure rather than a guess.
    pub async fn first_activity(
        &self,
        address: &str,
    ) -> std::result::Result<FirstActivity, ChainDataUnavailable> {
        self.first_activity_inner(address)
            .await
            .map_err(|e| ChainDataUnavailable {
                address: address.to_string(),
                reason: format!("{e:#}"),
            })
    }

    async fn first_activity_inner(&self, address: &str) -> Result<FirstActivity> {
        if let Some(transfer) = self.first_transfer(address, Direction::Sent).await? {
            let epoch = self.transfer_timestamp(&transfer).await?;
            return Ok(FirstActivity { epoch, funder: None });
        }
        if let Some(transfer) = self.first_transfer(address, Direction::Received).await? {
            let epoch = self.transfer_timestamp(&transfer).await?;
            let funder = transfer
                .from
                .as_deref()
                .map(crate::types::canonical_address)
                .filter(|funder| !funder.is_empty());
            return Ok(FirstActivity { epoch, funder });
        }

        let nonce = self.native_nonce(address).await?;
        let epoch = resolve_no_transfer_case(
            self.verification_mode,
            nonce,
            address,
            chrono::Utc::now().timestamp(),
        )?;
        Ok(FirstActivity { epoch, funder: None })
    }

    /// Outbound transaction count across all transfer categories, capped at
    /// the configured page size. Falls back to the native account nonce when
    /// the indexer fails, which undercounts token transfers.
    pub async fn transaction_count(
        &self,
        address: &str,
    ) -> std::result::Result<TransferActivity, ChainDataUnavailable> {
        match self.indexed_transfer_count(address).await {
            Ok(activity) => Ok(activity),
            Err(indexer_err) => {
                warn!(
                    wallet = %address,
                    error = %indexer_err,
                    "indexer transfer count failed, falling back to native nonce"
                );
                match self.native_nonce(address).await {
                    Ok(nonce) => Ok(TransferActivity {
                        count: u32::try_from(nonce).unwrap_or(u32::MAX),
                        capped: false,
                    }),
                    Err(nonce_err) => Err(ChainDataUnavailable {
                        address: address.to_string(),
                        reason: format!(
                            "indexer count failed ({indexer_err:#}); nonce fallback failed ({nonce_err:#})"
                        ),
                    }),
                }
            }
        }
    }

    async fn indexed_transfer_count(&self, address: &str) -> Result<TransferActivity> {
        let params = serde_json::json!({
            "fromBlock": "0x0",
            "toBlock": "latest",
            "fromAddress": address,
            "category": ["external", "internal", "erc20", "erc721", "erc1155"],
            "withMetadata": false,
            "order": "asc",
            "maxCount": format!("{:#x}", self.transfer_count_cap),
        });
        let result = self
            .rpc_call(
                &self.transfers_api_url,
                "alchemy_getAssetTransfers",
                serde_json::json!([params]),
            )
            .await?;
        let page: TransfersPage =
            serde_json::from_value(result).context("failed to deserialize transfers page")?;

        let count = u32::try_from(page.transfers.len()).unwrap_or(u32::MAX);
        Ok(TransferActivity {
            count,
            capped: count >= self.transfer_count_cap,
        })
    }

    async fn first_transfer(
        &self,
        address: &str,
        direction: Direction,
    ) -> Result<Option<RawTransfer>> {
        let mut params = serde_json::json!({
            "fromBlock": "0x0",
            "toBlock": "latest",
            "category": ["external", "internal", "erc20", "erc721", "erc1155"],
            "withMetadata": true,
            "order": "asc",
            "maxCount": "0x1",
        });
        match direction {
            Direction::Sent => params["fromAddress"] = serde_json::json!(address),
            Direction::Received => params["toAddress"] = serde_json::json!(address),
        }

        let result = self
            .rpc_call(
                &self.transfers_api_url,
                "alchemy_getAssetTransfers",
                serde_json::json!([params]),
            )
            .await?;
        let page: TransfersPage =
            serde_json::from_value(result).context("failed to deserialize transfers page")?;
        Ok(page.transfers.into_iter().next())
    }

    /// Timestamp of a transfer: block timestamp metadata when present,
    /// otherwise the containing block via RPC, then via the indexer's own
    /// block lookup as a last resort.
    async fn transfer_timestamp(&self, transfer: &RawTransfer) -> Result<i64> {
        if let Some(raw) = transfer
            .metadata
            .as_ref()
            .and_then(|m| m.block_timestamp.as_deref())
        {
            match chrono::DateTime::parse_from_rfc3339(raw) {
                Ok(dt) => return Ok(dt.timestamp()),
                Err(e) => {
                    warn!(timestamp = %raw, error = %e, "malformed block timestamp metadata");
                }
            }
        }

        let block_num = transfer
            .block_num
            .as_deref()
            .context("transfer has neither timestamp metadata nor block number")?;
        match self.block_timestamp(&self.rpc_url, block_num).await {
            Ok(ts) => Ok(ts),
            Err(e) => {
                debug!(block = %block_num, error = %e, "rpc block lookup failed, trying indexer");
                self.block_timestamp(&self.transfers_api_url, block_num)
                    .await
            }
        }
    }

    async fn block_timestamp(&self, url: &str, block_num: &str) -> Result<i64> {
        let result = self
            .rpc_call(url, "eth_getBlockByNumber", serde_json::json!([block_num, false]))
            .await?;
        let hex = result
            .get("timestamp")
            .and_then(serde_json::Value::as_str)
            .context("block reply missing timestamp")?;
        let secs = parse_hex_u64(hex)?;
        i64::try_from(secs).context("block timestamp out of range")
    }

    pub async fn native_nonce(&self, address: &str) -> Result<u64> {
        let result = self
            .rpc_call(
                &self.rpc_url,
                "eth_getTransactionCount",
                serde_json::json!([address, "latest"]),
            )
            .await?;
        let hex = result
            .as_str()
            .context("eth_getTransactionCount returned a non-string result")?;
        parse_hex_u64(hex)
    }

    /// Native balance in whole coins, for display only.
    pub async fn native_balance(&self, address: &str) -> Result<f64> {
        let result = self
            .rpc_call(
                &self.rpc_url,
                "eth_getBalance",
                serde_json::json!([address, "latest"]),
            )
            .await?;
        let hex = result
            .as_str()
            .context("eth_getBalance returned a non-string result")?;
        let wei = parse_hex_u128(hex)?;
        Ok(wei as f64 / 1e18)
    }

    async fn rpc_call(
        &self,
        url: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        debug!(url = %url, method = %method, "rpc request");

        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("rpc request {method} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("rpc {method} returned {status}: {body}");
        }

        let reply: RpcReply = resp
            .json()
            .await
            .with_context(|| format!("failed to deserialize {method} response"))?;
        if let Some(err) = reply.error {
            anyhow::bail!("rpc {method} error {}: {}", err.code, err.message);
        }
        reply
            .result
            .ok_or_else(|| anyhow::anyhow!("rpc {method} returned no result"))
    }
}

/// Decide the creation time when the indexer reports no transfers at all.
/// Nonce 0 confirms a fresh wallet; a non-zero nonce means the indexer and
/// the chain disagree, which verification mode refuses to paper over.
fn resolve_no_transfer_case(
    verification_mode: bool,
    nonce: u64,
    address: &str,
    now_epoch: i64,
) -> Result<i64> {
    if nonce == 0 {
        debug!(wallet = %address, "no transfers and nonce 0, treating wallet as just created");
        return Ok(now_epoch);
    }
    if verification_mode {
        anyhow::bail!("indexer returned no transfers but account nonce is {nonce}");
    }
    warn!(
        wallet = %address,
        nonce = nonce,
        "indexer returned no transfers despite non-zero nonce, using current time"
    );
    Ok(now_epoch)
}

fn parse_hex_u64(hex: &str) -> Result<u64> {
    let digits = hex.trim_start_matches("0x");
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex quantity {hex:?}"))
}

fn parse_hex_u128(hex: &str) -> Result<u128> {
    let digits = hex.trim_start_matches("0x");
    u128::from_str_radix(digits, 16).with_context(|| format!("invalid hex quantity {hex:?}"))
}
