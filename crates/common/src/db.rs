use anyhow::Result;
use rusqlite::Connection;

/// Handle to a SQLite connection serviced by a dedicated background thread.
///
/// Every query crosses an mpsc channel to that thread, so Tokio workers
/// never block on database I/O. Cloning shares the channel, not the
/// connection.
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open `path`, apply PRAGMAs (WAL, foreign keys, busy_timeout) and
    /// schema migrations, and return the shared handle.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // Migrations take the schema write lock. A one-shot CLI run or an
        // admin sqlite3 session can hold it when the daemon starts, and
        // `database is locked` at startup would crash-loop under systemd.
        // Retry with backoff instead. The per-attempt busy_timeout stays
        // short so the waiting happens here, not inside SQLite.
        let mut wait = std::time::Duration::from_secs(1);
        let wait_cap = std::time::Duration::from_secs(30);
        let give_up_after = std::time::Duration::from_secs(10 * 60);
        let began = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    conn.execute_batch(SCHEMA)?;
                    migrate_wallets_wallet_created_at(conn)?;
                    // Normal runtime operations get the longer busy_timeout back.
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) if is_locked_error(&err) => {
                    if began.elapsed() >= give_up_after {
                        return Err(anyhow::Error::from(err)
                            .context("startup migrations failed: database stayed locked too long"));
                    }
                    tracing::warn!(
                        wait_for = ?wait,
                        "database locked during startup migrations, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    wait = (wait * 2).min(wait_cap);
                }
                Err(tokio_rusqlite::Error::Error(err)) => {
                    return Err(anyhow::Error::from(err).context("startup migrations failed"));
                }
                Err(other) => return Err(anyhow::anyhow!("opening {path}: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// In-memory database for tests.
    pub async fn open_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    /// Run `function` on the SQLite thread and await its result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn
            .call(move |conn| function(conn))
            .await
            .map_err(flatten_db_error)
    }

    /// Like [`Self::call`], but records latency and error metrics under `op`.
    ///
    /// The timing covers queueing behind other work on the SQLite thread as
    /// well as the SQL itself, so a slow reading here can mean contention
    /// rather than a slow query.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!("scanner_db_query_latency_ms", "op" => op, "status" => status)
            .record(ms);
        if res.is_err() {
            metrics::counter!("scanner_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }
}

fn is_locked_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

fn flatten_db_error(e: tokio_rusqlite::Error<anyhow::Error>) -> anyhow::Error {
    match e {
        tokio_rusqlite::Error::Error(err) => err,
        tokio_rusqlite::Error::ConnectionClosed => anyhow::anyhow!("database connection closed"),
        tokio_rusqlite::Error::Close((_, err)) => anyhow::anyhow!("database close error: {err}"),
        other => anyhow::anyhow!("database error: {other}"),
    }
}

/// Add wallet_created_at to wallets created before chain verification landed.
fn migrate_wallets_wallet_created_at(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let has: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('wallets') WHERE name='wallet_created_at'",
        [],
        |row| row.get(0),
    )?;
    if has == 0 {
        conn.execute("ALTER TABLE wallets ADD COLUMN wallet_created_at INTEGER", [])?;
    }
    Ok(())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    address TEXT PRIMARY KEY,          -- canonical lowercase
    risk_score INTEGER NOT NULL DEFAULT 0,
    funding_source TEXT,               -- sender of the funding transfer, when known
    is_suspicious INTEGER NOT NULL DEFAULT 0,
    is_high_win_rate INTEGER NOT NULL DEFAULT 0,
    is_starred INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    last_active_at TEXT NOT NULL DEFAULT (datetime('now')),
    wallet_created_at INTEGER          -- unix epoch of first on-chain activity
);

CREATE TABLE IF NOT EXISTS markets (
    market_id TEXT PRIMARY KEY,        -- venue outcome token id
    title TEXT,
    volume_usdc REAL NOT NULL DEFAULT 0,
    first_seen_at TEXT NOT NULL DEFAULT (datetime('now')),
    last_updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS trade_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL,
    market_id TEXT NOT NULL,
    amount_usdc REAL NOT NULL,
    side TEXT,
    traded_at INTEGER NOT NULL,        -- unix epoch
    recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(wallet_address, market_id, traded_at)
);

CREATE TABLE IF NOT EXISTS win_rates (
    wallet_address TEXT PRIMARY KEY,
    total_positions INTEGER NOT NULL,
    winning INTEGER NOT NULL,
    losing INTEGER NOT NULL,
    win_rate_pct REAL NOT NULL,
    total_profit REAL NOT NULL,
    avg_profit REAL NOT NULL,
    computed_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS job_status (
    job_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,              -- running, idle, failed
    last_run_at TEXT,
    duration_ms INTEGER,
    last_error TEXT,
    metadata TEXT,                     -- JSON with run summary
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_trade_events_wallet ON trade_events(wallet_address);
CREATE INDEX IF NOT EXISTS idx_trade_events_market ON trade_events(market_id);
CREATE INDEX IF NOT EXISTS idx_trade_events_traded_at ON trade_events(traded_at);
CREATE INDEX IF NOT EXISTS idx_wallets_last_active ON wallets(last_active_at);
CREATE INDEX IF NOT EXISTS idx_wallets_suspicious ON wallets(is_suspicious);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_all_tables() {
        let db = AsyncDb::open_memory().await.unwrap();
        let tables: Vec<String> = db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .filter_map(std::result::Result::ok)
                    .collect();
                Ok(rows)
            })
            .await
            .unwrap();

        assert!(tables.contains(&"wallets".to_string()));
        assert!(tables.contains(&"markets".to_string()));
        assert!(tables.contains(&"trade_events".to_string()));
        assert!(tables.contains(&"win_rates".to_string()));
        assert!(tables.contains(&"job_status".to_string()));
    }

    #[tokio::test]
    async fn test_open_creates_expected_indexes() {
        let db = AsyncDb::open_memory().await.unwrap();
        let indexes: Vec<String> = db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='index' ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .filter_map(std::result::Result::ok)
                    .collect();
                Ok(rows)
            })
            .await
            .unwrap();

        for name in [
            "idx_trade_events_wallet",
            "idx_trade_events_market",
            "idx_trade_events_traded_at",
            "idx_wallets_last_active",
            "idx_wallets_suspicious",
        ] {
            assert!(
                indexes.contains(&name.to_string()),
                "missing index {name}; existing indexes: {indexes:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(AsyncDb::open(&path).await.unwrap());
        // Second open against the same file must not fail.
        drop(AsyncDb::open(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_wallet_created_at_migration_adds_column() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        // Simulate an older database without the column.
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE wallets (
                    address TEXT PRIMARY KEY,
                    risk_score INTEGER NOT NULL DEFAULT 0,
                    funding_source TEXT,
                    is_suspicious INTEGER NOT NULL DEFAULT 0,
                    is_high_win_rate INTEGER NOT NULL DEFAULT 0,
                    is_starred INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    last_active_at TEXT NOT NULL DEFAULT (datetime('now'))
                );",
            )
            .unwrap();
        }

        let db = AsyncDb::open(&path).await.unwrap();
        let has: i64 = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM pragma_table_info('wallets') WHERE name='wallet_created_at'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(has, 1);
    }

    #[tokio::test]
    async fn test_async_db_is_clone_and_send() {
        let db = AsyncDb::open_memory().await.unwrap();
        let db2 = db.clone();

        db.call(|conn| {
            conn.execute(
                "INSERT INTO markets (market_id, title) VALUES ('tok-1', 'Test Market')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        // Read from the other clone — same underlying connection.
        let title: String = db2
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT title FROM markets WHERE market_id = 'tok-1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();

        assert_eq!(title, "Test Market");
    }

    #[tokio::test]
    async fn test_async_db_call_returns_error_on_bad_sql() {
        let db = AsyncDb::open_memory().await.unwrap();
        let result: Result<()> = db
            .call(|conn| {
                conn.execute("INVALID SQL", [])?;
                Ok(())
            })
            .await;

        assert!(result.is_err());
    }
}
