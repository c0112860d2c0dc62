//! Mirror the hub's live event stream into PostgreSQL, one shard per process.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use shuttle_common::health::HealthRegistry;
use shuttle_common::hub::HttpHubClient;
use shuttle_common::materializer::MessageWriter;
use shuttle_common::metrics::{serve, setup_service_router};
use shuttle_common::shard::{ShardConsumer, Sharding};
use shuttle_common::store::memory::MemoryStore;
use shuttle_common::store::postgres::PgStore;
use shuttle_common::store::{CheckpointStore, MessageStore};
use shuttle_common::time::SystemTime;

mod config;

use config::Config;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let sharding = Sharding::new(config.total_shards, config.shard_index)?;

    let (store, checkpoints): (Arc<dyn MessageStore>, Arc<dyn CheckpointStore>) = if config.dry_run
    {
        info!("dry run: writing to an in-process store");
        let store = Arc::new(MemoryStore::new());
        let messages: Arc<dyn MessageStore> = store.clone();
        let checkpoints: Arc<dyn CheckpointStore> = store;
        (messages, checkpoints)
    } else {
        let store = Arc::new(PgStore::new(
            &config.database_url,
            config.max_pg_connections,
            "shuttle-sync",
        )?);
        store.run_migrations().await?;
        let messages: Arc<dyn MessageStore> = store.clone();
        let checkpoints: Arc<dyn CheckpointStore> = store;
        (messages, checkpoints)
    };

    let hub = HttpHubClient::new(
        &config.hub_url,
        config.request_timeout.0,
        config.page_size,
        config.poll_interval.0,
    )?;

    let liveness = HealthRegistry::new("liveness");
    let shard_liveness = liveness
        .register(format!("shard-{}", sharding.key()), time::Duration::seconds(60))
        .await;

    let consumer = ShardConsumer::new(
        Arc::new(hub),
        store,
        checkpoints,
        Arc::new(MessageWriter::new(config.unmapped_message_policy)),
        Arc::new(SystemTime {}),
        sharding,
        config.checkpoint_interval,
        config.retry_policy.policy(),
        shard_liveness,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_service_router(liveness);
        if let Err(error) = serve(router, &bind).await {
            error!("failed to start serving metrics: {}", error);
        }
    });

    let summary = consumer.run(shutdown()).await?;
    info!(
        processed = summary.processed,
        position = ?summary.position,
        "shard consumer stopped"
    );

    Ok(())
}
