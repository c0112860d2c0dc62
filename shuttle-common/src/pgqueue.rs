//! # PgQueue
//!
//! A job queue backed by the `shuttle_jobs` PostgreSQL table.
//!
//! Workers claim jobs with `FOR UPDATE SKIP LOCKED` and mark them `running`, so a claimed job is
//! invisible to other workers without holding a transaction open for the whole reconciliation.
//! Jobs left `running` by a worker that died are put back by `release_stalled`.
use std::str::FromStr;
use std::time;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::types::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

/// Errors that originate from sqlx, wrapped to say which statement failed.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// A job cannot be retried. Returns the job so the caller can fail it instead.
#[derive(Error, Debug)]
#[error("retry is an invalid state for this job: {error}")]
pub struct RetryInvalidError<T> {
    pub job: T,
    pub error: String,
}

#[derive(Error, Debug)]
pub enum RetryError<T> {
    #[error(transparent)]
    DatabaseError(#[from] DatabaseError),
    #[error(transparent)]
    RetryInvalidError(#[from] RetryInvalidError<T>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be picked up once `scheduled_at` has passed.
    Available,
    Completed,
    /// Exhausted its attempts or hit a permanent error.
    Failed,
    /// Claimed by a worker.
    Running,
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "running" => Ok(JobStatus::Running),
            invalid => Err(ParseError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// A row of `shuttle_jobs` with its parameters decoded.
#[derive(sqlx::FromRow, Debug)]
pub struct Job<J> {
    pub id: i64,
    /// Starts at 1 on the first dequeue.
    pub attempt: i32,
    pub attempted_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Every worker that has claimed this job, oldest first.
    pub attempted_by: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub max_attempts: i32,
    pub parameters: Json<J>,
    pub queue: String,
    pub status: JobStatus,
}

impl<J> Job<J> {
    pub fn is_gte_max_attempts(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug)]
pub struct CompletedJob {
    pub id: i64,
    pub queue: String,
}

#[derive(Debug)]
pub struct RetriedJob {
    pub id: i64,
    pub queue: String,
    pub retry_interval: time::Duration,
}

#[derive(Debug)]
pub struct FailedJob<E> {
    pub id: i64,
    pub error: Json<E>,
    pub queue: String,
}

/// Transitions out of `running`. Each consumes the job: it is finished with once reported.
#[async_trait]
pub trait PgQueueJob {
    async fn complete(self) -> Result<CompletedJob, DatabaseError>;

    async fn fail<E: Serialize + Sync + Send>(
        self,
        error: E,
    ) -> Result<FailedJob<E>, DatabaseError>;

    /// Make the job available again after `retry_interval`.
    /// Fails with `RetryInvalidError` once the job has used all its attempts.
    async fn retry<E: Serialize + Sync + Send>(
        self,
        error: E,
        retry_interval: time::Duration,
    ) -> Result<RetriedJob, RetryError<Box<Self>>>;
}

/// A claimed job together with the pool used to report its outcome.
#[derive(Debug)]
pub struct PgJob<J> {
    pub job: Job<J>,
    pool: PgPool,
}

fn update_error(error: sqlx::Error) -> DatabaseError {
    DatabaseError::QueryError {
        command: "UPDATE".to_owned(),
        error,
    }
}

#[async_trait]
impl<J: Send> PgQueueJob for PgJob<J> {
    async fn complete(self) -> Result<CompletedJob, DatabaseError> {
        let base_query = r#"
UPDATE shuttle_jobs
SET status = 'completed'::job_status
WHERE queue = $1 AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.job.queue)
            .bind(self.job.id)
            .execute(&self.pool)
            .await
            .map_err(update_error)?;

        Ok(CompletedJob {
            id: self.job.id,
            queue: self.job.queue,
        })
    }

    async fn fail<E: Serialize + Sync + Send>(
        self,
        error: E,
    ) -> Result<FailedJob<E>, DatabaseError> {
        let json_error = Json(error);
        let base_query = r#"
UPDATE shuttle_jobs
SET
    status = 'failed'::job_status,
    errors = array_append(errors, $3)
WHERE queue = $1 AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.job.queue)
            .bind(self.job.id)
            .bind(&json_error)
            .execute(&self.pool)
            .await
            .map_err(update_error)?;

        Ok(FailedJob {
            id: self.job.id,
            error: json_error,
            queue: self.job.queue,
        })
    }

    async fn retry<E: Serialize + Sync + Send>(
        self,
        error: E,
        retry_interval: time::Duration,
    ) -> Result<RetriedJob, RetryError<Box<Self>>> {
        if self.job.is_gte_max_attempts() {
            return Err(RetryError::from(RetryInvalidError {
                job: Box::new(self),
                error: "Maximum attempts reached".to_owned(),
            }));
        }

        let json_error = Json(error);
        let base_query = r#"
UPDATE shuttle_jobs
SET
    status = 'available'::job_status,
    scheduled_at = NOW() + $3,
    errors = array_append(errors, $4)
WHERE queue = $1 AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.job.queue)
            .bind(self.job.id)
            .bind(retry_interval)
            .bind(&json_error)
            .execute(&self.pool)
            .await
            .map_err(update_error)?;

        Ok(RetriedJob {
            id: self.job.id,
            queue: self.job.queue,
            retry_interval,
        })
    }
}

/// A job to be enqueued. Consumed by `PgQueue::enqueue` so it is only enqueued once.
#[derive(Debug)]
pub struct NewJob<J> {
    pub max_attempts: i32,
    pub parameters: Json<J>,
}

impl<J> NewJob<J> {
    pub fn new(max_attempts: i32, parameters: J) -> Self {
        Self {
            max_attempts,
            parameters: Json(parameters),
        }
    }
}

pub type PgQueueResult<T> = std::result::Result<T, DatabaseError>;

/// A named queue over `shuttle_jobs`. Several queues may share the table.
#[derive(Clone)]
pub struct PgQueue {
    name: String,
    pool: PgPool,
}

impl PgQueue {
    /// Initialize a PgQueue by lazily connecting a pool to the database in `url`.
    pub fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        app_name: &'static str,
    ) -> PgQueueResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| DatabaseError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self {
            name: queue_name.to_owned(),
            pool,
        })
    }

    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn enqueue<J: Serialize + Sync>(&self, job: NewJob<J>) -> PgQueueResult<()> {
        let base_query = r#"
INSERT INTO shuttle_jobs
    (attempt, created_at, scheduled_at, max_attempts, parameters, queue, status)
VALUES
    (0, NOW(), NOW(), $1, $2, $3, 'available'::job_status)
        "#;

        sqlx::query(base_query)
            .bind(job.max_attempts)
            .bind(&job.parameters)
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Claim the oldest available job whose schedule has passed, if any.
    pub async fn dequeue<J: DeserializeOwned + Send + Unpin + 'static>(
        &self,
        attempted_by: &str,
    ) -> PgQueueResult<Option<PgJob<J>>> {
        let base_query = r#"
WITH available_in_queue AS (
    SELECT id
    FROM shuttle_jobs
    WHERE
        status = 'available'
        AND scheduled_at <= NOW()
        AND queue = $1
    ORDER BY attempt, scheduled_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE shuttle_jobs
SET
    attempted_at = NOW(),
    status = 'running'::job_status,
    attempt = attempt + 1,
    attempted_by = array_append(attempted_by, $2::text)
FROM available_in_queue
WHERE shuttle_jobs.id = available_in_queue.id
RETURNING shuttle_jobs.*
        "#;

        let job: Option<Job<J>> = sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(attempted_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(update_error)?;

        Ok(job.map(|job| PgJob {
            job,
            pool: self.pool.clone(),
        }))
    }

    /// Jobs that are available or running, including those scheduled for a later retry.
    pub async fn pending(&self) -> PgQueueResult<i64> {
        let base_query = r#"
SELECT COUNT(*)
FROM shuttle_jobs
WHERE queue = $1 AND status IN ('available', 'running')
        "#;

        let (count,): (i64,) = sqlx::query_as(base_query)
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(count)
    }

    /// Put back jobs that have been running for longer than `timeout`.
    /// Jobs with no attempts left are failed instead. Returns how many rows changed.
    pub async fn release_stalled(&self, timeout: time::Duration) -> PgQueueResult<u64> {
        let base_query = r#"
UPDATE shuttle_jobs
SET status = CASE
    WHEN attempt >= max_attempts THEN 'failed'::job_status
    ELSE 'available'::job_status
END
WHERE
    queue = $1
    AND status = 'running'
    AND attempted_at < NOW() - $2
        "#;

        let result = sqlx::query(base_query)
            .bind(&self.name)
            .bind(timeout)
            .execute(&self.pool)
            .await
            .map_err(update_error)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug, Clone)]
    struct JobParameters {
        fids: Vec<u64>,
    }

    fn worker_id() -> String {
        std::process::id().to_string()
    }

    #[test]
    fn test_parse_job_status() {
        assert_eq!("running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("cancelled".parse::<JobStatus>().is_err());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_can_enqueue_and_dequeue_job(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_can_enqueue_and_dequeue_job", db);
        let parameters = JobParameters { fids: vec![1, 2] };

        queue
            .enqueue(NewJob::new(1, parameters.clone()))
            .await
            .expect("failed to enqueue job");

        let pg_job: PgJob<JobParameters> = queue
            .dequeue(&worker_id())
            .await
            .expect("failed to dequeue job")
            .expect("didn't find a job to dequeue");

        assert_eq!(pg_job.job.attempt, 1);
        assert_eq!(pg_job.job.attempted_by, vec![worker_id()]);
        assert_eq!(pg_job.job.status, JobStatus::Running);
        assert_eq!(*pg_job.job.parameters.as_ref(), parameters);

        let again: Option<PgJob<JobParameters>> = queue
            .dequeue(&worker_id())
            .await
            .expect("failed to dequeue job");
        assert!(again.is_none(), "running jobs are not handed out twice");

        pg_job.complete().await.expect("failed to complete job");
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_dequeue_returns_none_on_empty_queue(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_dequeue_returns_none_on_empty_queue", db);

        let job: Option<PgJob<JobParameters>> = queue
            .dequeue(&worker_id())
            .await
            .expect("failed to dequeue job");

        assert!(job.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_can_retry_job_until_max_attempts(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_can_retry_job_until_max_attempts", db);
        queue
            .enqueue(NewJob::new(2, JobParameters { fids: vec![7] }))
            .await
            .expect("failed to enqueue job");

        let first: PgJob<JobParameters> = queue.dequeue(&worker_id()).await.unwrap().unwrap();
        first
            .retry("hub unavailable", time::Duration::ZERO)
            .await
            .expect("failed to retry job");

        let second: PgJob<JobParameters> = queue
            .dequeue(&worker_id())
            .await
            .unwrap()
            .expect("retried job is available again");
        assert_eq!(second.job.attempt, 2);

        match second.retry("hub unavailable", time::Duration::ZERO).await {
            Err(RetryError::RetryInvalidError(RetryInvalidError { job, .. })) => {
                job.fail("hub unavailable").await.expect("failed to fail job");
            }
            Ok(retried) => panic!("job {} was retried past its max attempts", retried.id),
            Err(error) => panic!("failed to retry job: {}", error),
        }

        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_release_stalled_jobs(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_release_stalled_jobs", db);
        queue
            .enqueue(NewJob::new(3, JobParameters { fids: vec![9] }))
            .await
            .unwrap();

        let claimed: PgJob<JobParameters> = queue.dequeue("dead-worker").await.unwrap().unwrap();
        tokio::time::sleep(time::Duration::from_millis(20)).await;

        let released = queue
            .release_stalled(time::Duration::from_millis(1))
            .await
            .expect("failed to release stalled jobs");
        assert_eq!(released, 1);

        let reclaimed: PgJob<JobParameters> = queue
            .dequeue(&worker_id())
            .await
            .unwrap()
            .expect("released job is available again");
        assert_eq!(reclaimed.job.id, claimed.job.id);
        assert_eq!(reclaimed.job.attempted_by, vec!["dead-worker".to_owned(), worker_id()]);
    }
}
