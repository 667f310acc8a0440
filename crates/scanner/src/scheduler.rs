use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub interval: Duration,
    pub tick: mpsc::Sender<()>,
    /// Fire the first tick right away instead of one interval in.
    pub run_immediately: bool,
}

/// Spawn one ticker task per job. Each ticker pushes unit ticks into the
/// job's channel and exits when the worker side hangs up.
pub fn start(jobs: Vec<JobSpec>) -> Vec<JoinHandle<()>> {
    jobs.into_iter().map(spawn_job).collect()
}

fn spawn_job(job: JobSpec) -> JoinHandle<()> {
    tokio::spawn(async move {
        let first_tick = if job.run_immediately {
            Instant::now()
        } else {
            Instant::now() + job.interval
        };
        let mut timer = tokio::time::interval_at(first_tick, job.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            timer.tick().await;
            tracing::debug!(job = %job.name, "scheduler tick");
            if job.tick.send(()).await.is_err() {
                break;
            }
        }
    })
}
