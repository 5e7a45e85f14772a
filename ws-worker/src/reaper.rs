use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};
use ws_orchestrator::SqlCredentialStore;
use ws_queue::JobQueue;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub requeued_jobs: usize,
    pub purged_tokens: u64,
}

/// Recovers jobs stranded by dead workers and expires capture tokens.
pub struct Reaper {
    queue: JobQueue,
    credentials: SqlCredentialStore,
    stale_after: Duration,
    max_attempts: u32,
}

impl Reaper {
    pub fn new(
        queue: JobQueue,
        credentials: SqlCredentialStore,
        stale_after: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            credentials,
            stale_after,
            max_attempts,
        }
    }

    pub async fn run_once(&self) -> anyhow::Result<ReapReport> {
        let requeued_jobs = self
            .queue
            .requeue_stale(self.stale_after, self.max_attempts)
            .await?;
        let purged_tokens = self.credentials.purge_capture_tokens().await?;

        if requeued_jobs > 0 || purged_tokens > 0 {
            info!(requeued_jobs, purged_tokens, "Reaper pass finished");
        }

        Ok(ReapReport {
            requeued_jobs,
            purged_tokens,
        })
    }
}

pub async fn start_reaper_task(reaper: Reaper, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    info!("Reaper task running (checks every {} seconds)", interval_secs);

    loop {
        interval.tick().await;

        if let Err(e) = reaper.run_once().await {
            error!("Reaper pass failed: {}", e);
        }
    }
}
