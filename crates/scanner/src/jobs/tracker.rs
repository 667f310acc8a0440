use std::time::Instant;

use anyhow::Result;
use common::db::AsyncDb;

/// Per-run row in `job_status`. Start marks the job running; exactly one
/// of [`Self::success`] or [`Self::fail`] finalizes the run.
pub struct JobTracker {
    db: AsyncDb,
    job_name: String,
    started: Instant,
}

impl JobTracker {
    pub async fn start(db: &AsyncDb, job_name: &str) -> Result<Self> {
        let name = job_name.to_string();
        db.call_named("job_tracker.start", move |conn| {
            conn.execute(
                "INSERT INTO job_status (job_name, status, last_run_at, updated_at)
                 VALUES (?1, 'running', datetime('now'), datetime('now'))
                 ON CONFLICT(job_name) DO UPDATE SET
                    status = 'running', last_run_at = datetime('now'),
                    updated_at = datetime('now'), last_error = NULL, duration_ms = NULL",
                rusqlite::params![name],
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db: db.clone(),
            job_name: job_name.to_string(),
            started: Instant::now(),
        })
    }

    pub async fn success(self, metadata: Option<serde_json::Value>) -> Result<()> {
        let meta_str = metadata.map(|v| v.to_string());
        self.finish("idle", None, meta_str).await
    }

    pub async fn fail(self, error: &anyhow::Error) -> Result<()> {
        let error_msg = error.to_string();
        self.finish("failed", Some(error_msg), None).await
    }

    /// Overwrite the running row's metadata with an in-flight snapshot.
    /// The final [`Self::success`] summary replaces the last snapshot.
    pub async fn update_progress(&self, metadata: serde_json::Value) -> Result<()> {
        let name = self.job_name.clone();
        let snapshot = metadata.to_string();
        self.db
            .call_named("job_tracker.progress", move |conn| {
                conn.execute(
                    "UPDATE job_status
                     SET metadata = ?2, updated_at = datetime('now')
                     WHERE job_name = ?1",
                    rusqlite::params![name, snapshot],
                )?;
                Ok(())
            })
            .await
    }

    /// One UPDATE serves both outcomes. `coalesce` keeps the last
    /// written metadata when the finishing call supplies none; a failed
    /// run leaves its final progress snapshot (or the previous run's
    /// summary) in place.
    async fn finish(
        self,
        status: &'static str,
        last_error: Option<String>,
        metadata: Option<String>,
    ) -> Result<()> {
        let elapsed_ms = self.started.elapsed().as_millis() as i64;
        let name = self.job_name;

        self.db
            .call_named("job_tracker.finish", move |conn| {
                conn.execute(
                    "UPDATE job_status
                     SET status = ?2,
                         duration_ms = ?3,
                         last_error = ?4,
                         metadata = coalesce(?5, metadata),
                         updated_at = datetime('now')
                     WHERE job_name = ?1",
                    rusqlite::params![name, status, elapsed_ms, last_error, metadata],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::store::Store;

    use super::*;

    #[tokio::test]
    async fn test_start_marks_job_running() {
        let db = AsyncDb::open_memory().await.unwrap();
        let store = Store::new(db.clone());

        let _tracker = JobTracker::start(&db, "wallet_scan").await.unwrap();

        let rows = store.list_job_statuses().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job_name, "wallet_scan");
        assert_eq!(rows[0].status, "running");
        assert!(rows[0].last_run_at.is_some());
        assert!(rows[0].duration_ms.is_none());
    }

    #[tokio::test]
    async fn test_success_records_duration_and_metadata() {
        let db = AsyncDb::open_memory().await.unwrap();
        let store = Store::new(db.clone());

        let tracker = JobTracker::start(&db, "wallet_scan").await.unwrap();
        tracker
            .success(Some(serde_json::json!({"processed": 12})))
            .await
            .unwrap();

        let rows = store.list_job_statuses().await.unwrap();
        assert_eq!(rows[0].status, "idle");
        assert!(rows[0].duration_ms.is_some());
        assert!(rows[0].metadata.as_deref().unwrap().contains("\"processed\":12"));
        assert!(rows[0].last_error.is_none());
    }

    #[tokio::test]
    async fn test_fail_records_error_and_rerun_clears_it() {
        let db = AsyncDb::open_memory().await.unwrap();
        let store = Store::new(db.clone());

        let tracker = JobTracker::start(&db, "win_rate_refresh").await.unwrap();
        tracker
            .fail(&anyhow::anyhow!("positions endpoint down"))
            .await
            .unwrap();

        let rows = store.list_job_statuses().await.unwrap();
        assert_eq!(rows[0].status, "failed");
        assert_eq!(rows[0].last_error.as_deref(), Some("positions endpoint down"));

        // The next start clears the failure state.
        let _tracker = JobTracker::start(&db, "win_rate_refresh").await.unwrap();
        let rows = store.list_job_statuses().await.unwrap();
        assert_eq!(rows[0].status, "running");
        assert!(rows[0].last_error.is_none());
    }

    #[tokio::test]
    async fn test_update_progress_keeps_job_running() {
        let db = AsyncDb::open_memory().await.unwrap();
        let store = Store::new(db.clone());

        let tracker = JobTracker::start(&db, "win_rate_refresh").await.unwrap();
        tracker
            .update_progress(serde_json::json!({"processed": 25, "total": 200}))
            .await
            .unwrap();

        let rows = store.list_job_statuses().await.unwrap();
        assert_eq!(rows[0].status, "running");
        assert!(rows[0].metadata.as_deref().unwrap().contains("\"processed\":25"));
        assert!(rows[0].duration_ms.is_none());

        tracker
            .success(Some(serde_json::json!({"computed": 190})))
            .await
            .unwrap();
        let rows = store.list_job_statuses().await.unwrap();
        assert_eq!(rows[0].status, "idle");
        assert!(rows[0].metadata.as_deref().unwrap().contains("\"computed\":190"));
    }

    #[tokio::test]
    async fn test_failed_run_keeps_previous_metadata() {
        let db = AsyncDb::open_memory().await.unwrap();
        let store = Store::new(db.clone());

        let tracker = JobTracker::start(&db, "wallet_scan").await.unwrap();
        tracker
            .success(Some(serde_json::json!({"processed": 40})))
            .await
            .unwrap();

        let tracker = JobTracker::start(&db, "wallet_scan").await.unwrap();
        tracker.fail(&anyhow::anyhow!("upstream down")).await.unwrap();

        let rows = store.list_job_statuses().await.unwrap();
        assert_eq!(rows[0].status, "failed");
        assert!(rows[0].metadata.as_deref().unwrap().contains("\"processed\":40"));
    }
}
