//! Consume `PgQueue` reconcile jobs.
use std::sync::Arc;

use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use shuttle_common::health::HealthRegistry;
use shuttle_common::metrics::{serve, setup_service_router};
use shuttle_common::pgqueue::PgQueue;
use shuttle_common::store::postgres::PgStore;
use shuttle_worker::config::Config;
use shuttle_worker::worker::{release_stalled_loop, ReconcileWorker};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    setup_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let store = PgStore::new(
        &config.database_url,
        config.max_pg_connections,
        "shuttle-worker",
    )?;
    store.run_migrations().await?;
    let queue = PgQueue::new_from_pool(config.queue_name.as_str(), store.pool().clone());

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_owned(), time::Duration::seconds(60))
        .await;
    let janitor_liveness = liveness
        .register(
            "janitor".to_owned(),
            time::Duration::try_from(config.janitor_interval.0 * 3)?,
        )
        .await;

    let name = format!("{}-{}", config.worker_name, Uuid::now_v7());
    info!(worker = name, queue = config.queue_name.as_str(), "starting");

    let worker = ReconcileWorker::new(
        &name,
        &queue,
        config.poll_interval.0,
        config.reconciler(Arc::new(store))?,
        config.max_concurrent_jobs,
        config.retry_policy.policy(),
        worker_liveness,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_service_router(liveness);
        if let Err(error) = serve(router, &bind).await {
            error!("failed to start serving metrics: {}", error);
        }
    });

    let janitor_queue = queue.clone();
    let janitor_interval = config.janitor_interval.0;
    let stalled_job_timeout = config.stalled_job_timeout.0;
    tokio::task::spawn(async move {
        release_stalled_loop(
            &janitor_queue,
            janitor_interval,
            stalled_job_timeout,
            janitor_liveness,
        )
        .await
    });

    worker.run().await?;

    Ok(())
}
