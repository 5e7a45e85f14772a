use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{QueueError, Result};
use crate::job::{Job, JobKind, JobPayload};
use crate::keys::{inflight_key, queue_key, PROCESSING_LIST, RESERVATION_LEASES};
use crate::substrate::QueueSubstrate;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// How long a per-workspace in-flight claim survives without being released.
    pub claim_ttl: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FailOptions {
    pub requeue: bool,
    pub max_attempts: u32,
}

impl Default for FailOptions {
    fn default() -> Self {
        Self {
            requeue: true,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Appended back to its source queue for another attempt.
    Requeued,
    /// Terminal failure; the job is gone from the substrate.
    Dropped,
    /// The job was no longer in the processing list (already acked, failed or reaped).
    NotReserved,
}

/// Typed job operations on top of a [`QueueSubstrate`].
#[derive(Clone)]
pub struct JobQueue {
    substrate: Arc<dyn QueueSubstrate>,
    settings: QueueSettings,
}

impl JobQueue {
    pub fn new(substrate: Arc<dyn QueueSubstrate>) -> Self {
        Self::with_settings(substrate, QueueSettings::default())
    }

    pub fn with_settings(substrate: Arc<dyn QueueSubstrate>, settings: QueueSettings) -> Self {
        Self {
            substrate,
            settings,
        }
    }

    /// Persist a new job at the tail of its queue.
    ///
    /// Fails with [`QueueError::WorkspaceBusy`] while another job for the same
    /// workspace is queued or in flight.
    #[instrument(skip(self, payload), fields(workspace_id = %payload.workspace_id))]
    pub async fn enqueue(&self, kind: JobKind, payload: JobPayload) -> Result<Job> {
        let job = Job::new(kind, payload);
        let claim = inflight_key(job.workspace_id());

        if !self
            .substrate
            .claim(&claim, &job.id, self.settings.claim_ttl)
            .await?
        {
            return Err(QueueError::WorkspaceBusy(job.payload.workspace_id));
        }

        let raw = serde_json::to_string(&job)?;
        if let Err(e) = self.substrate.push(&queue_key(kind), &raw).await {
            if let Err(release_err) = self.substrate.release(&claim, &job.id).await {
                warn!("Failed to release claim {}: {}", claim, release_err);
            }
            return Err(e);
        }

        info!(job_id = %job.id, "Enqueued {} job", kind);
        Ok(job)
    }

    pub async fn enqueue_provision(&self, payload: JobPayload) -> Result<Job> {
        self.enqueue(JobKind::Provision, payload).await
    }

    pub async fn enqueue_destroy(&self, payload: JobPayload) -> Result<Job> {
        self.enqueue(JobKind::Destroy, payload).await
    }

    /// Reserve the job at the head of `kind`'s queue.
    pub async fn dequeue(&self, kind: JobKind) -> Result<Option<Job>> {
        let Some(raw) = self
            .substrate
            .reserve(
                &queue_key(kind),
                PROCESSING_LIST,
                RESERVATION_LEASES,
                Utc::now().timestamp_millis(),
            )
            .await?
        else {
            return Ok(None);
        };

        let mut job: Job = match serde_json::from_str(&raw) {
            Ok(job) => job,
            Err(e) => {
                error!(queue = %kind, "Dropping malformed job payload: {}", e);
                self.substrate.remove(PROCESSING_LIST, &raw, 1).await?;
                self.substrate.lease_remove(RESERVATION_LEASES, &raw).await?;
                return Err(QueueError::Malformed(e));
            }
        };

        job.attempts += 1;
        job.reservation = Some(raw);

        debug!(job_id = %job.id, attempts = job.attempts, "Dequeued {} job", kind);
        Ok(Some(job))
    }

    /// Mark a reserved job as done. Acking twice is harmless.
    pub async fn ack(&self, job: &Job) -> Result<()> {
        let raw = job.reservation_key()?;
        let removed = self.substrate.remove(PROCESSING_LIST, &raw, 1).await?;
        self.substrate.lease_remove(RESERVATION_LEASES, &raw).await?;

        if removed > 0 {
            self.release_claim(job).await?;
            debug!(job_id = %job.id, "Acked job");
        }
        Ok(())
    }

    /// Push a reserved job's lease forward so `requeue_stale` leaves it alone
    /// while its worker is still running it.
    pub async fn renew(&self, job: &Job) -> Result<()> {
        let raw = job.reservation_key()?;
        self.substrate
            .lease_set(RESERVATION_LEASES, &raw, Utc::now().timestamp_millis())
            .await?;
        debug!(job_id = %job.id, "Renewed reservation lease");
        Ok(())
    }

    /// Take a reserved job out of processing and either retry it or drop it.
    pub async fn fail(&self, job: &Job, options: FailOptions) -> Result<FailOutcome> {
        let raw = job.reservation_key()?;
        let removed = self.substrate.remove(PROCESSING_LIST, &raw, 1).await?;
        self.substrate.lease_remove(RESERVATION_LEASES, &raw).await?;

        if removed == 0 {
            warn!(job_id = %job.id, "Failed job was not in the processing list");
            return Ok(FailOutcome::NotReserved);
        }

        if options.requeue && job.attempts < options.max_attempts {
            let mut retry = job.clone();
            retry.reservation = None;
            self.substrate
                .push(&queue_key(job.kind), &serde_json::to_string(&retry)?)
                .await?;
            info!(
                job_id = %job.id,
                attempts = job.attempts,
                max_attempts = options.max_attempts,
                "Requeued {} job",
                job.kind
            );
            return Ok(FailOutcome::Requeued);
        }

        self.release_claim(job).await?;
        Ok(FailOutcome::Dropped)
    }

    pub async fn queue_length(&self, kind: JobKind) -> Result<usize> {
        self.substrate.len(&queue_key(kind)).await
    }

    pub async fn processing_length(&self) -> Result<usize> {
        self.substrate.len(PROCESSING_LIST).await
    }

    /// Up to `limit` pending jobs of `kind`, oldest first.
    pub async fn list_jobs(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>> {
        self.list(&queue_key(kind), limit).await
    }

    /// Up to `limit` reserved jobs, in reservation order.
    pub async fn list_processing(&self, limit: usize) -> Result<Vec<Job>> {
        self.list(PROCESSING_LIST, limit).await
    }

    async fn list(&self, list: &str, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let entries = self.substrate.range(list, 0, limit as isize - 1).await?;
        Ok(entries
            .iter()
            .filter_map(|raw| match serde_json::from_str::<Job>(raw) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(list, "Skipping malformed job entry: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Requeue reservations older than `stale_after`.
    ///
    /// A reservation that outlived its lease belongs to a worker that died
    /// before ack/fail. The lost run counts as an attempt; jobs that reach
    /// `max_attempts` this way are dropped.
    #[instrument(skip(self))]
    pub async fn requeue_stale(&self, stale_after: Duration, max_attempts: u32) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - stale_after.as_millis() as i64;
        let stale = self
            .substrate
            .lease_expired(RESERVATION_LEASES, cutoff)
            .await?;

        let mut requeued = 0;
        for raw in stale {
            let removed = self.substrate.remove(PROCESSING_LIST, &raw, 1).await?;
            self.substrate.lease_remove(RESERVATION_LEASES, &raw).await?;
            if removed == 0 {
                continue;
            }

            let mut job: Job = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    error!("Dropping malformed stale reservation: {}", e);
                    continue;
                }
            };
            job.attempts += 1;

            if job.attempts >= max_attempts {
                error!(
                    job_id = %job.id,
                    workspace_id = %job.payload.workspace_id,
                    attempts = job.attempts,
                    "Stale {} job exhausted its attempts, dropping",
                    job.kind
                );
                self.release_claim(&job).await?;
                continue;
            }

            self.substrate
                .push(&queue_key(job.kind), &serde_json::to_string(&job)?)
                .await?;
            warn!(job_id = %job.id, attempts = job.attempts, "Requeued stale {} job", job.kind);
            requeued += 1;
        }

        Ok(requeued)
    }

    async fn release_claim(&self, job: &Job) -> Result<()> {
        self.substrate
            .release(&inflight_key(job.workspace_id()), &job.id)
            .await
    }
}
