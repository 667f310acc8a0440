use crate::db::AsyncDb;
use crate::types::WinRateSummary;
use anyhow::Result;
use rusqlite::params;

/// Persistence gateway consumed by the pipeline. Every operation is a named
/// query over the shared [`AsyncDb`] handle so DB latency shows up per-op in
/// the metrics.
#[derive(Clone)]
pub struct Store {
    db: AsyncDb,
}

/// A persisted wallet row. Timestamps are SQLite `datetime('now')` strings;
/// `wallet_created_at` is the unix epoch of first on-chain activity.
#[derive(Debug, Clone)]
pub struct WalletRecord {
    pub address: String,
    pub risk_score: u32,
    pub funding_source: Option<String>,
    pub is_suspicious: bool,
    pub is_high_win_rate: bool,
    pub is_starred: bool,
    pub created_at: String,
    pub last_active_at: String,
    pub wallet_created_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MarketRecord {
    pub market_id: String,
    pub title: Option<String>,
    pub volume_usdc: f64,
}

#[derive(Debug, Clone)]
pub struct WinRateRecord {
    pub wallet_address: String,
    pub summary: WinRateSummary,
    pub computed_at: String,
}

#[derive(Debug, Clone)]
pub struct JobStatusRecord {
    pub job_name: String,
    pub status: String,
    pub last_run_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub last_error: Option<String>,
    pub metadata: Option<String>,
}

/// Fields for a wallet created on first qualifying sighting.
#[derive(Debug, Clone)]
pub struct NewWallet {
    pub address: String,
    pub risk_score: u32,
    pub is_suspicious: bool,
    pub funding_source: Option<String>,
    pub wallet_created_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewTradeEvent {
    pub wallet_address: String,
    pub market_id: String,
    pub amount_usdc: f64,
    pub side: Option<String>,
    pub traded_at: i64,
}

/// Result of an insert guarded by a uniqueness constraint. Concurrent
/// workers can race on the same key; the loser sees `AlreadyExists` and
/// must treat it as a skip, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

fn wallet_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WalletRecord> {
    Ok(WalletRecord {
        address: row.get(0)?,
        risk_score: row.get(1)?,
        funding_source: row.get(2)?,
        is_suspicious: row.get(3)?,
        is_high_win_rate: row.get(4)?,
        is_starred: row.get(5)?,
        created_at: row.get(6)?,
        last_active_at: row.get(7)?,
        wallet_created_at: row.get(8)?,
    })
}

const WALLET_COLUMNS: &str = "address, risk_score, funding_source, is_suspicious, \
     is_high_win_rate, is_starred, created_at, last_active_at, wallet_created_at";

impl Store {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }

    pub async fn find_wallet_by_address(&self, address: &str) -> Result<Option<WalletRecord>> {
        let address = address.to_string();
        self.db
            .call_named("wallets.find_by_address", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {WALLET_COLUMNS} FROM wallets WHERE address = ?1"
                ))?;
                let mut rows = stmt.query_map(params![address], wallet_from_row)?;
                Ok(rows.next().transpose()?)
            })
            .await
    }

    /// Insert a new wallet. A concurrent create for the same address is
    /// resolved by the primary key: the second insert reports
    /// [`CreateOutcome::AlreadyExists`] and changes nothing.
    pub async fn create_wallet(&self, wallet: NewWallet) -> Result<CreateOutcome> {
        self.db
            .call_named("wallets.create", move |conn| {
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO wallets
                     (address, risk_score, funding_source, is_suspicious, wallet_created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        wallet.address,
                        wallet.risk_score,
                        wallet.funding_source,
                        wallet.is_suspicious,
                        wallet.wallet_created_at,
                    ],
                )?;
                Ok(if changed == 0 {
                    CreateOutcome::AlreadyExists
                } else {
                    CreateOutcome::Created
                })
            })
            .await
    }

    /// Known wallets are never re-scored; a new sighting only moves
    /// `last_active_at`.
    pub async fn update_wallet_last_active(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.db
            .call_named("wallets.touch_last_active", move |conn| {
                conn.execute(
                    "UPDATE wallets SET last_active_at = datetime('now') WHERE address = ?1",
                    params![address],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_wallet_high_win_rate(&self, address: &str, high: bool) -> Result<()> {
        let address = address.to_string();
        self.db
            .call_named("wallets.set_high_win_rate", move |conn| {
                conn.execute(
                    "UPDATE wallets SET is_high_win_rate = ?2 WHERE address = ?1",
                    params![address, high],
                )?;
                Ok(())
            })
            .await
    }

    /// Toggle the operator star. Returns the new state, or None when the
    /// wallet is unknown.
    pub async fn toggle_wallet_star(&self, address: &str) -> Result<Option<bool>> {
        let address = address.to_string();
        self.db
            .call_named("wallets.toggle_star", move |conn| {
                let changed = conn.execute(
                    "UPDATE wallets SET is_starred = NOT is_starred WHERE address = ?1",
                    params![address],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                let starred: bool = conn.query_row(
                    "SELECT is_starred FROM wallets WHERE address = ?1",
                    params![address],
                    |row| row.get(0),
                )?;
                Ok(Some(starred))
            })
            .await
    }

    pub async fn find_market_by_id(&self, market_id: &str) -> Result<Option<MarketRecord>> {
        let market_id = market_id.to_string();
        self.db
            .call_named("markets.find_by_id", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT market_id, title, volume_usdc FROM markets WHERE market_id = ?1",
                )?;
                let mut rows = stmt.query_map(params![market_id], |row| {
                    Ok(MarketRecord {
                        market_id: row.get(0)?,
                        title: row.get(1)?,
                        volume_usdc: row.get(2)?,
                    })
                })?;
                Ok(rows.next().transpose()?)
            })
            .await
    }

    pub async fn create_market(
        &self,
        market_id: &str,
        title: Option<&str>,
        volume_usdc: f64,
    ) -> Result<CreateOutcome> {
        let market_id = market_id.to_string();
        let title = title.map(ToString::to_string);
        self.db
            .call_named("markets.create", move |conn| {
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO markets (market_id, title, volume_usdc)
                     VALUES (?1, ?2, ?3)",
                    params![market_id, title, volume_usdc],
                )?;
                Ok(if changed == 0 {
                    CreateOutcome::AlreadyExists
                } else {
                    CreateOutcome::Created
                })
            })
            .await
    }

    pub async fn increment_market_volume(&self, market_id: &str, amount_usdc: f64) -> Result<()> {
        let market_id = market_id.to_string();
        self.db
            .call_named("markets.increment_volume", move |conn| {
                conn.execute(
                    "UPDATE markets
                     SET volume_usdc = volume_usdc + ?2, last_updated_at = datetime('now')
                     WHERE market_id = ?1",
                    params![market_id, amount_usdc],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn create_trade_event(&self, event: NewTradeEvent) -> Result<CreateOutcome> {
        self.db
            .call_named("trade_events.create", move |conn| {
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO trade_events
                     (wallet_address, market_id, amount_usdc, side, traded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        event.wallet_address,
                        event.market_id,
                        event.amount_usdc,
                        event.side,
                        event.traded_at,
                    ],
                )?;
                Ok(if changed == 0 {
                    CreateOutcome::AlreadyExists
                } else {
                    CreateOutcome::Created
                })
            })
            .await
    }

    pub async fn count_distinct_markets_for_wallet(&self, address: &str) -> Result<u32> {
        let address = address.to_string();
        self.db
            .call_named("trade_events.count_distinct_markets", move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(DISTINCT market_id) FROM trade_events WHERE wallet_address = ?1",
                    params![address],
                    |row| row.get(0),
                )?)
            })
            .await
    }

    pub async fn list_markets_for_wallet(&self, address: &str) -> Result<Vec<String>> {
        let address = address.to_string();
        self.db
            .call_named("trade_events.list_markets", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT market_id FROM trade_events WHERE wallet_address = ?1",
                )?;
                let rows = stmt
                    .query_map(params![address], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn trade_event_exists(&self, address: &str, market_id: &str) -> Result<bool> {
        let address = address.to_string();
        let market_id = market_id.to_string();
        self.db
            .call_named("trade_events.exists", move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM trade_events
                     WHERE wallet_address = ?1 AND market_id = ?2",
                    params![address, market_id],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    pub async fn upsert_win_rate(&self, address: &str, summary: WinRateSummary) -> Result<()> {
        let address = address.to_string();
        self.db
            .call_named("win_rates.upsert", move |conn| {
                conn.execute(
                    "INSERT INTO win_rates
                     (wallet_address, total_positions, winning, losing, win_rate_pct,
                      total_profit, avg_profit, computed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
                     ON CONFLICT(wallet_address) DO UPDATE SET
                       total_positions = excluded.total_positions,
                       winning = excluded.winning,
                       losing = excluded.losing,
                       win_rate_pct = excluded.win_rate_pct,
                       total_profit = excluded.total_profit,
                       avg_profit = excluded.avg_profit,
                       computed_at = excluded.computed_at",
                    params![
                        address,
                        summary.total_positions,
                        summary.winning,
                        summary.losing,
                        summary.win_rate_pct,
                        summary.total_profit,
                        summary.avg_profit,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn find_win_rate(&self, address: &str) -> Result<Option<WinRateRecord>> {
        let address = address.to_string();
        self.db
            .call_named("win_rates.find", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT wallet_address, total_positions, winning, losing, win_rate_pct,
                            total_profit, avg_profit, computed_at
                     FROM win_rates WHERE wallet_address = ?1",
                )?;
                let mut rows = stmt.query_map(params![address], |row| {
                    Ok(WinRateRecord {
                        wallet_address: row.get(0)?,
                        summary: WinRateSummary {
                            total_positions: row.get(1)?,
                            winning: row.get(2)?,
                            losing: row.get(3)?,
                            win_rate_pct: row.get(4)?,
                            total_profit: row.get(5)?,
                            avg_profit: row.get(6)?,
                        },
                        computed_at: row.get(7)?,
                    })
                })?;
                Ok(rows.next().transpose()?)
            })
            .await
    }

    /// Flagged wallets, most recently active first. CLI and win-rate refresh
    /// both read from this.
    pub async fn list_flagged_wallets(&self, limit: u32) -> Result<Vec<WalletRecord>> {
        self.db
            .call_named("wallets.list_flagged", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {WALLET_COLUMNS} FROM wallets
                     WHERE is_suspicious = 1
                     ORDER BY last_active_at DESC
                     LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(params![limit], wallet_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_wallet_addresses(&self) -> Result<Vec<String>> {
        self.db
            .call_named("wallets.list_addresses", move |conn| {
                let mut stmt = conn
                    .prepare("SELECT address FROM wallets ORDER BY last_active_at DESC")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_job_statuses(&self) -> Result<Vec<JobStatusRecord>> {
        self.db
            .call_named("job_status.list", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_name, status, last_run_at, duration_ms, last_error, metadata
                     FROM job_status ORDER BY job_name",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(JobStatusRecord {
                            job_name: row.get(0)?,
                            status: row.get(1)?,
                            last_run_at: row.get(2)?,
                            duration_ms: row.get(3)?,
                            last_error: row.get(4)?,
                            metadata: row.get(5)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Direct access for callers that need their own queries (job tracker,
    /// maintenance).
    pub fn db(&self) -> &AsyncDb {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> Store {
        Store::new(AsyncDb::open_memory().await.unwrap())
    }

    fn new_wallet(address: &str) -> NewWallet {
        NewWallet {
            address: address.to_string(),
            risk_score: 80,
            is_suspicious: true,
            funding_source: Some("0xfunder".to_string()),
            wallet_created_at: Some(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn test_create_and_find_wallet() {
        let store = open_store().await;
        let outcome = store.create_wallet(new_wallet("0xabc")).await.unwrap();
        assert_eq!(outcome, CreateOutcome::Created);

        let found = store.find_wallet_by_address("0xabc").await.unwrap().unwrap();
        assert_eq!(found.address, "0xabc");
        assert_eq!(found.risk_score, 80);
        assert!(found.is_suspicious);
        assert!(!found.is_high_win_rate);
        assert!(!found.is_starred);
        assert_eq!(found.funding_source.as_deref(), Some("0xfunder"));
        assert_eq!(found.wallet_created_at, Some(1_700_000_000));

        assert!(store.find_wallet_by_address("0xdef").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_wallet_create_reports_already_exists() {
        let store = open_store().await;
        assert_eq!(
            store.create_wallet(new_wallet("0xabc")).await.unwrap(),
            CreateOutcome::Created
        );

        let mut second = new_wallet("0xabc");
        second.risk_score = 10;
        assert_eq!(
            store.create_wallet(second).await.unwrap(),
            CreateOutcome::AlreadyExists
        );

        // The original score must survive the losing insert.
        let found = store.find_wallet_by_address("0xabc").await.unwrap().unwrap();
        assert_eq!(found.risk_score, 80);
    }

    #[tokio::test]
    async fn test_touch_last_active_changes_only_that_field() {
        let store = open_store().await;
        store.create_wallet(new_wallet("0xabc")).await.unwrap();

        // Back-date last_active_at so the touch is observable.
        store
            .db()
            .call(|conn| {
                conn.execute(
                    "UPDATE wallets SET last_active_at = '2020-01-01 00:00:00'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let before = store.find_wallet_by_address("0xabc").await.unwrap().unwrap();
        store.update_wallet_last_active("0xabc").await.unwrap();
        let after = store.find_wallet_by_address("0xabc").await.unwrap().unwrap();

        assert_ne!(before.last_active_at, after.last_active_at);
        assert_eq!(before.created_at, after.created_at);
        assert_eq!(before.risk_score, after.risk_score);
    }

    #[tokio::test]
    async fn test_market_create_then_increment_volume() {
        let store = open_store().await;
        assert_eq!(
            store
                .create_market("tok-1", Some("Election winner"), 6000.0)
                .await
                .unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            store.create_market("tok-1", None, 1.0).await.unwrap(),
            CreateOutcome::AlreadyExists
        );

        store.increment_market_volume("tok-1", 4000.0).await.unwrap();
        let market = store.find_market_by_id("tok-1").await.unwrap().unwrap();
        assert!((market.volume_usdc - 10000.0).abs() < f64::EPSILON);
        assert_eq!(market.title.as_deref(), Some("Election winner"));
    }

    #[tokio::test]
    async fn test_trade_events_distinct_market_count_and_exists() {
        let store = open_store().await;
        for (market, ts) in [("tok-1", 100), ("tok-1", 200), ("tok-2", 300)] {
            store
                .create_trade_event(NewTradeEvent {
                    wallet_address: "0xabc".to_string(),
                    market_id: market.to_string(),
                    amount_usdc: 7000.0,
                    side: Some("BUY".to_string()),
                    traded_at: ts,
                })
                .await
                .unwrap();
        }

        assert_eq!(
            store.count_distinct_markets_for_wallet("0xabc").await.unwrap(),
            2
        );
        let mut markets = store.list_markets_for_wallet("0xabc").await.unwrap();
        markets.sort();
        assert_eq!(markets, vec!["tok-1", "tok-2"]);
        assert!(store.trade_event_exists("0xabc", "tok-1").await.unwrap());
        assert!(!store.trade_event_exists("0xabc", "tok-9").await.unwrap());
        assert_eq!(
            store.count_distinct_markets_for_wallet("0xother").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_duplicate_trade_event_is_ignored() {
        let store = open_store().await;
        let event = NewTradeEvent {
            wallet_address: "0xabc".to_string(),
            market_id: "tok-1".to_string(),
            amount_usdc: 7000.0,
            side: None,
            traded_at: 100,
        };
        assert_eq!(
            store.create_trade_event(event.clone()).await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            store.create_trade_event(event).await.unwrap(),
            CreateOutcome::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_upsert_win_rate_overwrites() {
        let store = open_store().await;
        let first = WinRateSummary {
            total_positions: 7,
            winning: 5,
            losing: 2,
            win_rate_pct: 71.43,
            total_profit: 280.0,
            avg_profit: 40.0,
        };
        store.upsert_win_rate("0xabc", first).await.unwrap();

        let mut second = first;
        second.total_positions = 9;
        second.winning = 6;
        second.losing = 3;
        second.win_rate_pct = 66.67;
        store.upsert_win_rate("0xabc", second).await.unwrap();

        let record = store.find_win_rate("0xabc").await.unwrap().unwrap();
        assert_eq!(record.summary.total_positions, 9);
        assert!((record.summary.win_rate_pct - 66.67).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_list_flagged_wallets_filters_unflagged() {
        let store = open_store().await;
        store.create_wallet(new_wallet("0xaaa")).await.unwrap();
        let mut benign = new_wallet("0xbbb");
        benign.is_suspicious = false;
        benign.risk_score = 0;
        store.create_wallet(benign).await.unwrap();

        let flagged = store.list_flagged_wallets(10).await.unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].address, "0xaaa");

        let all = store.list_wallet_addresses().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_set_wallet_high_win_rate_flag() {
        let store = open_store().await;
        store.create_wallet(new_wallet("0xabc")).await.unwrap();
        store.set_wallet_high_win_rate("0xabc", true).await.unwrap();
        let found = store.find_wallet_by_address("0xabc").await.unwrap().unwrap();
        assert!(found.is_high_win_rate);
    }

    #[tokio::test]
    async fn test_toggle_wallet_star_flips_and_reports_unknown() {
        let store = open_store().await;
        store.create_wallet(new_wallet("0xabc")).await.unwrap();

        assert_eq!(store.toggle_wallet_star("0xabc").await.unwrap(), Some(true));
        assert_eq!(store.toggle_wallet_star("0xabc").await.unwrap(), Some(false));
        assert_eq!(store.toggle_wallet_star("0xmissing").await.unwrap(), None);
    }
}
