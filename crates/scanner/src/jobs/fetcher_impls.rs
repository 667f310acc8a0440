use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use common::chain::{ChainDataProvider, ChainDataUnavailable, FirstActivity, TransferActivity};
use common::polymarket::{classify_api_error, PolymarketClient};
use common::types::{ApiActivity, ApiClosedPosition, ApiTrade, IndexFill};

use super::fetcher_traits::*;

/// Times the call and counts it once by status, tagging error kinds from
/// the transport error chain.
async fn instrumented<T>(
    endpoint: &'static str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    let start = Instant::now();
    let res = fut.await;
    let ms = start.elapsed().as_secs_f64() * 1000.0;

    metrics::histogram!("scanner_api_latency_ms", "endpoint" => endpoint).record(ms);
    match &res {
        Ok(_) => {
            metrics::counter!("scanner_api_requests_total", "endpoint" => endpoint, "status" => "ok")
                .increment(1);
        }
        Err(e) => {
            metrics::counter!("scanner_api_requests_total", "endpoint" => endpoint, "status" => "error")
                .increment(1);
            metrics::counter!(
                "scanner_api_errors_total",
                "endpoint" => endpoint,
                "kind" => classify_api_error(e).as_str()
            )
            .increment(1);
        }
    }
    res
}

/// Chain lookups share one failure kind. The provider already folded its
/// indexer and RPC fallbacks into `ChainDataUnavailable`.
async fn instrumented_chain<T>(
    endpoint: &'static str,
    fut: impl std::future::Future<Output = std::result::Result<T, ChainDataUnavailable>>,
) -> std::result::Result<T, ChainDataUnavailable> {
    let start = Instant::now();
    let res = fut.await;
    let ms = start.elapsed().as_secs_f64() * 1000.0;

    metrics::histogram!("scanner_api_latency_ms", "endpoint" => endpoint).record(ms);
    if res.is_ok() {
        metrics::counter!("scanner_api_requests_total", "endpoint" => endpoint, "status" => "ok")
            .increment(1);
    } else {
        metrics::counter!("scanner_api_requests_total", "endpoint" => endpoint, "status" => "error")
            .increment(1);
        metrics::counter!(
            "scanner_api_errors_total",
            "endpoint" => endpoint,
            "kind" => "chain_unavailable"
        )
        .increment(1);
    }
    res
}

impl TradeFetch for PolymarketClient {
    async fn data_api_trades(&self, limit: u32) -> Result<Vec<ApiTrade>> {
        instrumented("data_api_trades", self.fetch_recent_trades(limit)).await
    }

    async fn activity_trades(&self, limit: u32) -> Result<Vec<ApiActivity>> {
        instrumented("activity_trades", self.fetch_recent_activity(limit)).await
    }

    async fn index_fill_trades(&self, limit: u32) -> Result<Vec<IndexFill>> {
        instrumented("index_fills", self.fetch_index_fills(limit)).await
    }
}

// Shared-client ergonomics: worker loops own the aggregator but share the
// process-wide HTTP client through an Arc.
impl<T: TradeFetch + Send + Sync> TradeFetch for Arc<T> {
    async fn data_api_trades(&self, limit: u32) -> Result<Vec<ApiTrade>> {
        self.as_ref().data_api_trades(limit).await
    }

    async fn activity_trades(&self, limit: u32) -> Result<Vec<ApiActivity>> {
        self.as_ref().activity_trades(limit).await
    }

    async fn index_fill_trades(&self, limit: u32) -> Result<Vec<IndexFill>> {
        self.as_ref().index_fill_trades(limit).await
    }
}

impl PositionsPager for PolymarketClient {
    fn positions_url(&self, user: &str, limit: u32, offset: u32) -> String {
        self.closed_positions_url(user, limit, offset)
    }

    async fn closed_positions_page(
        &self,
        user: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ApiClosedPosition>> {
        instrumented(
            "closed_positions",
            self.fetch_closed_positions(user, limit, offset),
        )
        .await
    }
}

impl ChainData for ChainDataProvider {
    async fn first_activity(
        &self,
        address: &str,
    ) -> std::result::Result<FirstActivity, ChainDataUnavailable> {
        instrumented_chain(
            "chain_first_activity",
            ChainDataProvider::first_activity(self, address),
        )
        .await
    }

    async fn transaction_count(
        &self,
        address: &str,
    ) -> std::result::Result<TransferActivity, ChainDataUnavailable> {
        instrumented_chain(
            "chain_transaction_count",
            ChainDataProvider::transaction_count(self, address),
        )
        .await
    }
}
