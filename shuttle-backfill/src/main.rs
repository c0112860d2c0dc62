//! Enqueue reconcile jobs covering every identity, or a given list of them.
use std::sync::Arc;

use chrono::Utc;
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use shuttle_common::health::HealthRegistry;
use shuttle_common::hub::HttpHubClient;
use shuttle_common::pgqueue::PgQueue;
use shuttle_common::store::postgres::PgStore;
use shuttle_worker::worker::ReconcileWorker;

mod backfill;
mod config;

use config::Config;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    setup_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let worker_config = &config.worker;

    let store = PgStore::new(
        &worker_config.database_url,
        worker_config.max_pg_connections,
        "shuttle-backfill",
    )?;
    store.run_migrations().await?;
    let queue = PgQueue::new_from_pool(worker_config.queue_name.as_str(), store.pool().clone());

    let hub = HttpHubClient::new(
        &worker_config.hub_url,
        worker_config.request_timeout.0,
        worker_config.page_size,
        worker_config.poll_interval.0,
    )?;

    let started_at = Utc::now();
    let fids = backfill::backfill_fids(
        &hub,
        config.backfill_fids.clone().map(|fids| fids.0),
        config.max_fid,
    )
    .await?;
    let fid_count = fids.len();
    let jobs = backfill::plan(fids, config.batch_size, started_at);
    let enqueued = backfill::enqueue_all(&queue, jobs, config.max_attempts).await?;
    info!(
        fids = fid_count,
        jobs = enqueued,
        queue = queue.name(),
        "backfill enqueued"
    );

    if !config.drain_after_enqueue {
        return Ok(());
    }

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_owned(), time::Duration::seconds(60))
        .await;
    let name = format!("backfill-{}", Uuid::now_v7());
    let worker = ReconcileWorker::new(
        &name,
        &queue,
        worker_config.poll_interval.0,
        worker_config.reconciler(Arc::new(store))?,
        worker_config.max_concurrent_jobs,
        worker_config.retry_policy.policy(),
        worker_liveness,
    );

    let handed_out = worker.drain(worker_config.stalled_job_timeout.0).await?;
    info!(
        jobs = handed_out,
        elapsed_seconds = (Utc::now() - started_at).num_seconds(),
        "backfill drained"
    );

    Ok(())
}
