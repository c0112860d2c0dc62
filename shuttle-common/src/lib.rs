pub mod classifier;
pub mod config;
pub mod events;
pub mod health;
pub mod hub;
pub mod jobs;
pub mod materializer;
pub mod message;
pub mod metrics;
pub mod pgqueue;
pub mod reconcile;
pub mod retry;
pub mod shard;
pub mod store;
pub mod test_utils;
pub mod time;
