use anyhow::Result;
use common::chain::{ChainDataUnavailable, FirstActivity, TransferActivity};
use common::types::{ApiActivity, ApiClosedPosition, ApiTrade, IndexFill};

/// Raw trade feeds, one method per upstream source shape. The aggregator
/// decides ordering, retries and decoding on top of this.
pub trait TradeFetch {
    fn data_api_trades(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ApiTrade>>> + Send;

    fn activity_trades(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ApiActivity>>> + Send;

    fn index_fill_trades(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<IndexFill>>> + Send;
}

/// Paged access to a wallet's closed positions. `positions_url` exists so
/// page fetches can log where they went without re-deriving the URL.
pub trait PositionsPager {
    fn positions_url(&self, user: &str, limit: u32, offset: u32) -> String;

    fn closed_positions_page(
        &self,
        user: &str,
        limit: u32,
        offset: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ApiClosedPosition>>> + Send;
}

/// On-chain facts about a wallet, behind the indexer/RPC fallback chain.
pub trait ChainData {
    fn first_activity(
        &self,
        address: &str,
    ) -> impl std::future::Future<Output = std::result::Result<FirstActivity, ChainDataUnavailable>> + Send;

    fn transaction_count(
        &self,
        address: &str,
    ) -> impl std::future::Future<Output = std::result::Result<TransferActivity, ChainDataUnavailable>> + Send;
}
