use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "scanner_trades_fetched_total",
        "Trades surviving decode and dedup, by source."
    );
    describe_counter!(
        "scanner_trades_malformed_total",
        "Trade records dropped during decode, by source."
    );
    describe_counter!(
        "scanner_trades_deduped_total",
        "Trades dropped as already seen, by source."
    );
    describe_counter!(
        "scanner_source_failures_total",
        "Trade source batches that failed outright, by source."
    );
    describe_gauge!(
        "scanner_dedup_seen_size",
        "Trade identities currently held in the dedup set."
    );
    describe_counter!(
        "scanner_wallets_processed_total",
        "Wallets whose processing completed without error."
    );
    describe_counter!("scanner_wallets_new_total", "Wallets seen for the first time.");
    describe_counter!(
        "scanner_wallets_flagged_total",
        "New wallets flagged suspicious and persisted."
    );
    describe_counter!(
        "scanner_wallets_skipped_total",
        "Known wallets skipped with an activity touch."
    );
    describe_counter!(
        "scanner_scan_errors_total",
        "Per-wallet failures within scan cycles."
    );
    describe_histogram!(
        "scanner_scan_duration_ms",
        "Wall-clock duration of one scan cycle in milliseconds."
    );
    describe_gauge!(
        "scanner_last_scan_epoch",
        "Unix time of the last completed scan cycle."
    );
    describe_counter!(
        "scanner_win_rates_computed_total",
        "Win-rate summaries computed and stored."
    );
    describe_gauge!(
        "scanner_flagged_wallets",
        "Flagged wallets eligible for win-rate refresh."
    );
    describe_counter!("scanner_api_requests_total", "Upstream API requests made.");
    describe_counter!(
        "scanner_api_errors_total",
        "Upstream API failures by endpoint and error kind."
    );
    describe_histogram!(
        "scanner_api_latency_ms",
        "Upstream API request latency in milliseconds."
    );
    describe_histogram!(
        "scanner_db_query_latency_ms",
        "SQLite operation latency in milliseconds, by op."
    );
    describe_counter!(
        "scanner_db_query_errors_total",
        "SQLite operation failures, by op."
    );
    describe_counter!(
        "scanner_wal_checkpoint_total",
        "WAL checkpoint attempts by status."
    );
    describe_gauge!(
        "scanner_wal_checkpoint_pages",
        "Pages checkpointed in the last WAL checkpoint."
    );
    describe_gauge!("scanner_db_file_size_bytes", "Main database file size.");
    describe_gauge!("scanner_db_wal_size_bytes", "WAL file size.");
    describe_gauge!("scanner_db_page_count", "SQLite page count.");
    describe_gauge!("scanner_db_page_size_bytes", "SQLite page size.");
    describe_gauge!("scanner_db_freelist_count", "SQLite freelist page count.");
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let bind: SocketAddr = ([0, 0, 0, 0], port).into();
    let handle = PrometheusBuilder::new()
        .with_http_listener(bind)
        .install_recorder()?;
    Ok(handle)
}
