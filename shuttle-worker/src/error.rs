use serde::Serialize;
use shuttle_common::pgqueue;
use shuttle_common::reconcile::ReconcileError;
use thiserror::Error;

/// Errors that stop a worker or one of its job tasks.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred when executing a job")]
    DatabaseError(#[from] pgqueue::DatabaseError),
    #[error("a job could not be transitioned to its final state: {0}")]
    PgJobError(String),
}

/// What is stored in the job's `errors` column when a reconciliation fails.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ReconcileJobError {
    pub fid: u64,
    pub retryable: bool,
    pub message: String,
}

impl ReconcileJobError {
    pub fn new(fid: u64, error: &ReconcileError) -> Self {
        Self {
            fid,
            retryable: error.is_retryable(),
            message: error.to_string(),
        }
    }
}
