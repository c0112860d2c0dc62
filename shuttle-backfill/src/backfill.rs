use chrono::{DateTime, Utc};
use shuttle_common::hub::{HubClient, HubError};
use shuttle_common::jobs::{fid_batches, ShuttleJob};
use shuttle_common::pgqueue::{NewJob, PgQueue, PgQueueResult};
use tracing::info;

/// The identities to backfill: `fids` when given, otherwise `1..=max_fid`, asking the hub for
/// the maximum unless `max_fid` overrides it.
pub async fn backfill_fids(
    hub: &dyn HubClient,
    fids: Option<Vec<u64>>,
    max_fid: Option<u64>,
) -> Result<Vec<u64>, HubError> {
    if let Some(fids) = fids.filter(|fids| !fids.is_empty()) {
        return Ok(fids);
    }

    let max_fid = match max_fid {
        Some(max_fid) => max_fid,
        None => hub.max_fid().await?,
    };
    Ok((1..=max_fid).collect())
}

/// Reconcile jobs for `fids` in batches, followed by a completion marker.
pub fn plan(fids: Vec<u64>, batch_size: usize, started_at: DateTime<Utc>) -> Vec<ShuttleJob> {
    let mut jobs = fid_batches(fids, batch_size);
    jobs.push(ShuttleJob::CompletionMarker { started_at });
    jobs
}

pub async fn enqueue_all(
    queue: &PgQueue,
    jobs: Vec<ShuttleJob>,
    max_attempts: i32,
) -> PgQueueResult<usize> {
    let total = jobs.len();
    for (enqueued, job) in jobs.into_iter().enumerate() {
        queue.enqueue(NewJob::new(max_attempts, job)).await?;
        if (enqueued + 1) % 1000 == 0 {
            info!(enqueued = enqueued + 1, total, "enqueueing backfill jobs");
        }
    }
    Ok(total)
}
