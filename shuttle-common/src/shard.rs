//! # Shard
//!
//! Identity partitioning and the sequential consumer that applies one shard's events and keeps
//! its checkpoint.
//!
//! The checkpoint is the id of the last hub event whose observations were all written. It only
//! moves forward, and a restarted consumer resubscribes from it inclusively, so a crash between a
//! write and the next flush causes redelivery and nothing else.
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time;

use futures::StreamExt;
use thiserror::Error;
use tracing::{error, info, info_span, warn};

use crate::health::HealthHandle;
use crate::hub::{HubClient, HubError};
use crate::materializer::{MaterializeError, MessageWriter, ProcessingContext};
use crate::retry::RetryPolicy;
use crate::store::{CheckpointStore, MessageStore, StoreError};
use crate::time::TimeSource;

/// Name a shard's checkpoint is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardKey(String);

impl ShardKey {
    /// The key used when sharding is disabled.
    pub fn all() -> Self {
        ShardKey("all".to_owned())
    }

    pub fn index(index: u32) -> Self {
        ShardKey(index.to_string())
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("shard index {index} is out of range for {total} shards")]
pub struct ShardIndexError {
    pub index: u32,
    pub total: u32,
}

/// Which identities a consumer owns. `total_shards == 0` disables sharding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sharding {
    total_shards: u32,
    shard_index: u32,
}

impl Sharding {
    pub fn new(total_shards: u32, shard_index: u32) -> Result<Self, ShardIndexError> {
        if total_shards > 0 && shard_index >= total_shards {
            return Err(ShardIndexError {
                index: shard_index,
                total: total_shards,
            });
        }

        Ok(Self {
            total_shards,
            shard_index,
        })
    }

    pub fn unsharded() -> Self {
        Self {
            total_shards: 0,
            shard_index: 0,
        }
    }

    pub fn owns(&self, fid: u64) -> bool {
        self.total_shards == 0 || fid % u64::from(self.total_shards) == u64::from(self.shard_index)
    }

    pub fn key(&self) -> ShardKey {
        if self.total_shards == 0 {
            ShardKey::all()
        } else {
            ShardKey::index(self.shard_index)
        }
    }
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("checkpoint store failed: {0}")]
    Checkpoint(#[from] StoreError),
    #[error("failed to process hub event {event_id:?}: {error}")]
    Materialize {
        event_id: Option<u64>,
        error: MaterializeError,
    },
    #[error("hub subscription failed and cannot be retried: {0}")]
    Hub(HubError),
}

/// Where a consumer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub processed: u64,
    pub position: Option<u64>,
}

pub struct ShardConsumer {
    hub: Arc<dyn HubClient>,
    store: Arc<dyn MessageStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    writer: Arc<MessageWriter>,
    clock: Arc<dyn TimeSource>,
    sharding: Sharding,
    /// Flush the checkpoint every this many processed observations.
    checkpoint_interval: u64,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
    liveness_interval: time::Duration,
}

impl ShardConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub: Arc<dyn HubClient>,
        store: Arc<dyn MessageStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        writer: Arc<MessageWriter>,
        clock: Arc<dyn TimeSource>,
        sharding: Sharding,
        checkpoint_interval: u64,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            hub,
            store,
            checkpoints,
            writer,
            clock,
            sharding,
            checkpoint_interval: checkpoint_interval.max(1),
            retry_policy,
            liveness,
            liveness_interval: time::Duration::from_secs(10),
        }
    }

    async fn flush(&self, position: Option<u64>, flushed: &mut Option<u64>) -> Result<(), StoreError> {
        if let Some(position) = position {
            if *flushed != Some(position) {
                self.checkpoints
                    .save_checkpoint(&self.sharding.key(), position)
                    .await?;
                metrics::gauge!("shuttle_shard_checkpoint", "shard" => self.sharding.key().to_string())
                    .set(position as f64);
                *flushed = Some(position);
            }
        }
        Ok(())
    }

    /// Consume the shard until `shutdown` resolves, then persist the position reached.
    pub async fn run<S>(&self, shutdown: S) -> Result<ConsumerSummary, ConsumerError>
    where
        S: Future<Output = ()>,
    {
        let key = self.sharding.key();
        let span = info_span!("shard", shard = %key);
        let ctx = ProcessingContext::new(self.store.as_ref(), self.clock.as_ref(), span.clone());

        let mut position = self.checkpoints.load_checkpoint(&key).await?;
        let mut flushed = position;
        let mut processed: u64 = 0;
        let mut since_flush: u64 = 0;
        let mut failures: u32 = 0;
        info!(parent: &span, ?position, "resuming shard");

        tokio::pin!(shutdown);
        let mut liveness_tick = tokio::time::interval(self.liveness_interval);

        'subscription: loop {
            let mut events = self.hub.subscribe(self.sharding, position);

            loop {
                let next = tokio::select! {
                    _ = &mut shutdown => break 'subscription,
                    _ = liveness_tick.tick() => {
                        self.liveness.report_healthy().await;
                        continue;
                    }
                    next = events.next() => next,
                };

                let (event_id, result) = match next {
                    Some(Ok(event)) => (
                        Some(event.event_id),
                        self.writer.handle_event(&ctx, &event).await,
                    ),
                    Some(Err(HubError::UndecodableEvent { event_id, reason })) => (
                        event_id,
                        self.writer.handle_undecodable(&ctx, event_id, &reason),
                    ),
                    Some(Err(error)) if error.is_retryable() => {
                        failures += 1;
                        let wait = self.retry_policy.retry_interval(failures);
                        warn!(parent: &span, %error, attempt = failures, ?wait, "hub unavailable, resubscribing");
                        metrics::counter!("shuttle_hub_resubscriptions_total").increment(1);
                        tokio::select! {
                            _ = &mut shutdown => break 'subscription,
                            _ = tokio::time::sleep(wait) => continue 'subscription,
                        }
                    }
                    Some(Err(error)) => {
                        self.flush(position, &mut flushed).await?;
                        return Err(ConsumerError::Hub(error));
                    }
                    None => continue 'subscription,
                };

                failures = 0;
                if let Err(error) = result {
                    error!(parent: &span, ?event_id, %error, "failed to process event");
                    self.flush(position, &mut flushed).await?;
                    return Err(ConsumerError::Materialize { event_id, error });
                }

                // Resuming is inclusive, so an event only partly written is redelivered whole.
                if let Some(event_id) = event_id {
                    position = Some(position.map_or(event_id, |current| current.max(event_id)));
                }
                processed += 1;
                since_flush += 1;
                if since_flush >= self.checkpoint_interval {
                    self.flush(position, &mut flushed).await?;
                    since_flush = 0;
                }
            }
        }

        self.flush(position, &mut flushed).await?;
        info!(parent: &span, ?position, processed, "shard stopped");

        Ok(ConsumerSummary {
            processed,
            position,
        })
    }
}
