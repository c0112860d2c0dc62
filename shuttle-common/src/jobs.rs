//! Parameters of the jobs carried by the reconcile queue.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identities reconciled by one job.
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ShuttleJob {
    /// Reconcile each identity in turn.
    Reconcile { fids: Vec<u64> },
    /// Enqueued last by a backfill. Reaching it means every batch before it was handed out.
    CompletionMarker { started_at: DateTime<Utc> },
}

/// Split `fids` into reconcile jobs of at most `batch_size` identities, in order.
pub fn fid_batches(fids: impl IntoIterator<Item = u64>, batch_size: usize) -> Vec<ShuttleJob> {
    let fids: Vec<u64> = fids.into_iter().collect();

    fids.chunks(batch_size.max(1))
        .map(|chunk| ShuttleJob::Reconcile {
            fids: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_keep_order_and_size() {
        let batches = fid_batches(1..=23, DEFAULT_BATCH_SIZE);

        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches[2],
            ShuttleJob::Reconcile {
                fids: vec![21, 22, 23]
            }
        );
    }

    #[test]
    fn test_zero_batch_size_is_one_per_job() {
        assert_eq!(fid_batches(vec![4, 5], 0).len(), 2);
        assert!(fid_batches(Vec::new(), 10).is_empty());
    }

    #[test]
    fn test_jobs_are_tagged_by_name() {
        let json = serde_json::to_value(ShuttleJob::Reconcile { fids: vec![3] }).unwrap();
        assert_eq!(json, serde_json::json!({"name": "reconcile", "fids": [3]}));

        let marker: ShuttleJob = serde_json::from_str(
            r#"{"name": "completion_marker", "started_at": "2024-06-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(marker, ShuttleJob::CompletionMarker { .. }));
    }
}
