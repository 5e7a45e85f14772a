//! Job worker: dequeue, run the matching orchestrator, settle the job

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};
use ws_orchestrator::{DestroyOutcome, Destroyer, OrchestratorError, ProvisionOutcome, Provisioner};
use ws_queue::{FailOptions, FailOutcome, Job, JobKind, JobQueue, QueueError};

/// What running a job produced.
#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobResult {
    Provisioned(ProvisionOutcome),
    Destroyed { outcome: DestroyOutcome },
    Requeued { error: String },
    Dropped { error: String },
    /// The reservation was reaped while the job ran; the reaper owns it now.
    Lost { error: String },
}

#[derive(Debug, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub kind: JobKind,
    pub workspace_id: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub result: JobResult,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Processed {
    /// Nothing was queued.
    Empty,
    /// The head of the queue could not be decoded and was discarded.
    Malformed,
    Job(JobReport),
}

pub struct Worker {
    queue: JobQueue,
    provisioner: Provisioner,
    destroyer: Destroyer,
    max_attempts: u32,
    heartbeat: Option<Duration>,
}

impl Worker {
    pub fn new(
        queue: JobQueue,
        provisioner: Provisioner,
        destroyer: Destroyer,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            provisioner,
            destroyer,
            max_attempts,
            heartbeat: None,
        }
    }

    /// Renew the reservation lease of a running job every `every`.
    pub fn with_heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat = Some(every);
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Take the next job of `kind` and run it to completion.
    pub async fn process_next(&self, kind: JobKind) -> Result<Processed, QueueError> {
        let job = match self.queue.dequeue(kind).await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(Processed::Empty),
            Err(QueueError::Malformed(e)) => {
                warn!(queue = %kind, "Discarded malformed job: {}", e);
                return Ok(Processed::Malformed);
            }
            Err(e) => return Err(e),
        };

        self.process(job).await.map(Processed::Job)
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, job_kind = %job.kind, workspace_id = %job.payload.workspace_id)
    )]
    async fn process(&self, job: Job) -> Result<JobReport, QueueError> {
        info!(attempts = job.attempts, "Running {} job", job.kind);

        let work = async {
            match job.kind {
                JobKind::Provision => self
                    .provisioner
                    .run(&job.payload)
                    .await
                    .map(JobResult::Provisioned),
                JobKind::Destroy => self
                    .destroyer
                    .run(&job.payload)
                    .await
                    .map(|outcome| JobResult::Destroyed { outcome }),
            }
        };
        let outcome = self.renewing(&job, work).await;

        let result = match outcome {
            Ok(result) => {
                self.queue.ack(&job).await?;
                info!("Job completed");
                result
            }
            Err(e) => self.settle_failure(&job, e).await?,
        };

        Ok(JobReport {
            job_id: job.id.clone(),
            kind: job.kind,
            workspace_id: job.payload.workspace_id.clone(),
            attempts: job.attempts,
            result,
        })
    }

    /// Drive `work` while keeping the job's lease fresh.
    async fn renewing<F: Future>(&self, job: &Job, work: F) -> F::Output {
        let Some(every) = self.heartbeat else {
            return work.await;
        };

        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.renew(job).await {
                        warn!("Failed to renew reservation lease: {}", e);
                    }
                }
            }
        }
    }

    async fn settle_failure(&self, job: &Job, err: OrchestratorError) -> Result<JobResult, QueueError> {
        let options = FailOptions {
            requeue: err.is_retryable(),
            max_attempts: self.max_attempts,
        };
        let error = err.to_string();

        match self.queue.fail(job, options).await? {
            FailOutcome::Requeued => {
                warn!(attempts = job.attempts, "Job failed, will retry: {}", error);
                Ok(JobResult::Requeued { error })
            }
            FailOutcome::NotReserved => {
                warn!("Job failed after its reservation was reaped: {}", error);
                Ok(JobResult::Lost { error })
            }
            FailOutcome::Dropped => {
                error!(
                    attempts = job.attempts,
                    retryable = options.requeue,
                    "Job failed permanently: {}",
                    error
                );
                Ok(JobResult::Dropped { error })
            }
        }
    }

    /// Process one job of each kind. Returns whether any queue had work.
    pub async fn poll_once(&self) -> Result<bool, QueueError> {
        let mut busy = false;
        for kind in JobKind::ALL {
            if !matches!(self.process_next(kind).await?, Processed::Empty) {
                busy = true;
            }
        }
        Ok(busy)
    }
}

pub async fn start_worker_task(worker: Arc<Worker>, poll_interval: Duration) {
    info!(
        "Worker task running (polls every {} ms when idle)",
        poll_interval.as_millis()
    );

    loop {
        match worker.poll_once().await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => error!("Worker poll failed: {}", e),
        }
        tokio::time::sleep(poll_interval).await;
    }
}
