use std::sync::Arc;
use std::time;

use shuttle_common::health::HealthHandle;
use shuttle_common::jobs::ShuttleJob;
use shuttle_common::pgqueue::{PgJob, PgQueue, PgQueueJob, RetryError, RetryInvalidError};
use shuttle_common::reconcile::{ReconcileError, Reconciler};
use shuttle_common::retry::RetryPolicy;
use tokio::sync;
use tracing::{error, info, warn};

use crate::error::{ReconcileJobError, WorkerError};

/// Any `PgQueueJob` carrying `ShuttleJob` parameters.
pub trait ReconcileJob: PgQueueJob + Send {
    fn parameters(&self) -> &ShuttleJob;
    fn attempt(&self) -> i32;
    fn queue(&self) -> String;
}

impl ReconcileJob for PgJob<ShuttleJob> {
    fn parameters(&self) -> &ShuttleJob {
        &self.job.parameters
    }

    fn attempt(&self) -> i32 {
        self.job.attempt
    }

    fn queue(&self) -> String {
        self.job.queue.to_owned()
    }
}

/// Polls a `PgQueue` and reconciles the identities of each job on a bounded set of tasks.
pub struct ReconcileWorker<'p> {
    /// Recorded in `attempted_by` of every job this worker claims.
    name: String,
    queue: &'p PgQueue,
    poll_interval: time::Duration,
    reconciler: Reconciler,
    max_concurrent_jobs: usize,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl<'p> ReconcileWorker<'p> {
    pub fn new(
        name: &str,
        queue: &'p PgQueue,
        poll_interval: time::Duration,
        reconciler: Reconciler,
        max_concurrent_jobs: usize,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            poll_interval,
            reconciler,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            retry_policy,
            liveness,
        }
    }

    /// Wait until a job becomes available in our queue.
    async fn wait_for_job(&self) -> Result<PgJob<ShuttleJob>, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            if let Some(job) = self.queue.dequeue(&self.name).await? {
                return Ok(job);
            }
        }
    }

    fn report_semaphore_utilization(&self, semaphore: &sync::Semaphore) {
        let busy = self.max_concurrent_jobs - semaphore.available_permits();
        metrics::gauge!("shuttle_worker_saturation_percent")
            .set(busy as f64 / self.max_concurrent_jobs as f64);
    }

    /// Run this worker to continuously process any jobs that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));

        loop {
            self.report_semaphore_utilization(&semaphore);
            let job = self.wait_for_job().await?;
            spawn_reconcile_job_processing_task(
                self.reconciler.clone(),
                semaphore.clone(),
                self.retry_policy.clone(),
                job,
            )
            .await;
        }
    }

    /// Process jobs until the queue holds none that are available, running or awaiting a retry.
    /// Returns how many jobs this worker handed out.
    ///
    /// While waiting on running jobs, those running for longer than `stalled_timeout` are put
    /// back, so a job abandoned mid-run (by this worker or another) cannot hold the drain open.
    pub async fn drain(&self, stalled_timeout: time::Duration) -> Result<u64, WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));
        let mut handed_out = 0;

        loop {
            self.report_semaphore_utilization(&semaphore);
            self.liveness.report_healthy().await;

            if let Some(job) = self.queue.dequeue(&self.name).await? {
                spawn_reconcile_job_processing_task(
                    self.reconciler.clone(),
                    semaphore.clone(),
                    self.retry_policy.clone(),
                    job,
                )
                .await;
                handed_out += 1;
                continue;
            }

            if self.queue.pending().await? == 0 {
                break;
            }
            let released = self.queue.release_stalled(stalled_timeout).await?;
            if released > 0 {
                warn!(queue = self.queue.name(), released, "released stalled jobs while draining");
                metrics::counter!("shuttle_jobs_released_total").increment(released);
                continue;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        // Wait for the last tasks to return their permits.
        let permits = u32::try_from(self.max_concurrent_jobs).unwrap_or(u32::MAX);
        let _all = semaphore
            .acquire_many(permits)
            .await
            .expect("semaphore has been closed");

        Ok(handed_out)
    }
}

/// Put back jobs abandoned by workers that stopped while running them, every `interval`.
pub async fn release_stalled_loop(
    queue: &PgQueue,
    interval: time::Duration,
    timeout: time::Duration,
    liveness: HealthHandle,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        match queue.release_stalled(timeout).await {
            Ok(0) => {}
            Ok(released) => {
                warn!(queue = queue.name(), released, "released stalled jobs");
                metrics::counter!("shuttle_jobs_released_total").increment(released);
            }
            Err(error) => {
                error!("failed to release stalled jobs: {}", error);
                continue;
            }
        }
        liveness.report_healthy().await;
    }
}

/// Spawn a Tokio task to process a job once we acquire a permit.
/// Panics if `semaphore` is closed.
async fn spawn_reconcile_job_processing_task<J: ReconcileJob + 'static>(
    reconciler: Reconciler,
    semaphore: Arc<sync::Semaphore>,
    retry_policy: RetryPolicy,
    job: J,
) -> tokio::task::JoinHandle<Result<(), WorkerError>> {
    let permit = semaphore
        .acquire_owned()
        .await
        .expect("semaphore has been closed");

    let labels = [("queue", job.queue())];

    metrics::counter!("shuttle_reconcile_jobs_total", &labels).increment(1);

    tokio::spawn(async move {
        let result = process_reconcile_job(&reconciler, job, &retry_policy).await;
        drop(permit);
        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                error!("failed to process reconcile job: {}", error);
                Err(error)
            }
        }
    })
}

/// Run a job and transition it to completed, retried (retryable failure with attempts left)
/// or failed.
async fn process_reconcile_job<J: ReconcileJob>(
    reconciler: &Reconciler,
    job: J,
    retry_policy: &RetryPolicy,
) -> Result<(), WorkerError> {
    let labels = [("queue", job.queue())];
    let now = tokio::time::Instant::now();

    let fids = match job.parameters().clone() {
        ShuttleJob::CompletionMarker { started_at } => {
            info!(%started_at, "every backfill batch enqueued before this marker was handed out");
            job.complete()
                .await
                .map_err(|error| WorkerError::PgJobError(error.to_string()))?;
            return Ok(());
        }
        ShuttleJob::Reconcile { fids } => fids,
    };

    match reconcile_all(reconciler, &fids).await {
        Ok(()) => {
            job.complete()
                .await
                .map_err(|error| WorkerError::PgJobError(error.to_string()))?;

            metrics::counter!("shuttle_reconcile_jobs_completed", &labels).increment(1);
            metrics::histogram!("shuttle_reconcile_jobs_processing_duration_seconds", &labels)
                .record(now.elapsed().as_secs_f64());

            Ok(())
        }
        Err((fid, error)) if error.is_retryable() => {
            let job_error = ReconcileJobError::new(fid, &error);
            let attempt = u32::try_from(job.attempt()).unwrap_or(1);
            let retry_interval = retry_policy.retry_interval(attempt);

            match job.retry(job_error.clone(), retry_interval).await {
                Ok(_) => {
                    warn!(fid, attempt, ?retry_interval, "reconcile job will be retried: {}", error);
                    metrics::counter!("shuttle_reconcile_jobs_retried", &labels).increment(1);

                    Ok(())
                }
                Err(RetryError::RetryInvalidError(RetryInvalidError { job, .. })) => {
                    job.fail(job_error)
                        .await
                        .map_err(|job_error| WorkerError::PgJobError(job_error.to_string()))?;

                    metrics::counter!("shuttle_reconcile_jobs_failed", &labels).increment(1);

                    Ok(())
                }
                Err(RetryError::DatabaseError(job_error)) => {
                    Err(WorkerError::PgJobError(job_error.to_string()))
                }
            }
        }
        Err((fid, error)) => {
            error!(fid, "reconcile job failed and cannot be retried: {}", error);
            job.fail(ReconcileJobError::new(fid, &error))
                .await
                .map_err(|job_error| WorkerError::PgJobError(job_error.to_string()))?;

            metrics::counter!("shuttle_reconcile_jobs_failed", &labels).increment(1);

            Ok(())
        }
    }
}

/// Reconcile `fids` in order, stopping at the first identity that fails.
async fn reconcile_all(reconciler: &Reconciler, fids: &[u64]) -> Result<(), (u64, ReconcileError)> {
    for &fid in fids {
        let report = reconciler
            .reconcile_fid(fid)
            .await
            .map_err(|error| (fid, error))?;
        info!(
            fid,
            authoritative = report.authoritative,
            replayed = report.replayed,
            applied = report.applied,
            divergences = report.divergences.len(),
            "reconciled"
        );
    }
    Ok(())
}
