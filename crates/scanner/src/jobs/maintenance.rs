use anyhow::Result;
use common::db::AsyncDb;

/// Result of one `PRAGMA wal_checkpoint(TRUNCATE)` pass.
#[derive(Debug, Clone, Copy)]
pub struct WalCheckpoint {
    pub busy: bool,
    pub log_pages: i64,
    pub checkpointed_pages: i64,
}

/// Fold the WAL file back into the main database.
///
/// The scan and win-rate jobs write continuously, so without periodic
/// checkpointing the WAL file grows for as long as the daemon runs.
/// TRUNCATE mode resets the WAL to zero bytes after checkpointing all
/// pages. Metrics are recorded on the calling task, not the DB thread.
pub async fn run_wal_checkpoint_once(db: &AsyncDb) -> Result<WalCheckpoint> {
    let (busy, log_pages, checkpointed_pages) = db
        .call_named("wal_checkpoint.run", |conn| {
            Ok(conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?)
        })
        .await?;

    let outcome = WalCheckpoint { busy: busy != 0, log_pages, checkpointed_pages };
    if outcome.busy {
        tracing::warn!(log_pages, checkpointed_pages, "WAL checkpoint left pages behind, database busy");
        metrics::counter!("scanner_wal_checkpoint_total", "status" => "busy").increment(1);
    } else {
        tracing::info!(log_pages, checkpointed_pages, "WAL checkpoint complete");
        metrics::counter!("scanner_wal_checkpoint_total", "status" => "ok").increment(1);
    }
    metrics::gauge!("scanner_wal_checkpoint_pages").set(checkpointed_pages as f64);
    Ok(outcome)
}

/// Record SQLite size gauges: page stats from PRAGMAs plus the on-disk
/// sizes of the `.db` and `-wal` files.
pub async fn run_sqlite_stats_once(db: &AsyncDb, db_path: &str) -> Result<()> {
    let (page_count, page_size, freelist_count) = db
        .call_named("sqlite_stats.pragmas", |conn| {
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
            let freelist_count: i64 = conn.query_row("PRAGMA freelist_count", [], |r| r.get(0))?;
            Ok((page_count, page_size, freelist_count))
        })
        .await?;

    // File sizes come from the filesystem, no DB lock needed. A missing
    // WAL file reads as zero, which is also what a fully checkpointed
    // database looks like.
    let main_bytes = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    let wal_bytes = std::fs::metadata(format!("{db_path}-wal"))
        .map(|m| m.len())
        .unwrap_or(0);

    metrics::gauge!("scanner_db_file_size_bytes").set(main_bytes as f64);
    metrics::gauge!("scanner_db_wal_size_bytes").set(wal_bytes as f64);
    metrics::gauge!("scanner_db_page_count").set(page_count as f64);
    metrics::gauge!("scanner_db_page_size_bytes").set(page_size as f64);
    metrics::gauge!("scanner_db_freelist_count").set(freelist_count as f64);

    tracing::debug!(
        main_bytes,
        wal_bytes,
        page_count,
        page_size,
        freelist_count,
        "sqlite stats collected"
    );

    Ok(())
}
