use envconfig::Envconfig;
use shuttle_common::config::FidList;

#[derive(Envconfig, Clone)]
pub struct Config {
    /// Identities to backfill, e.g. `1,2,3`. Every identity up to the maximum when unset.
    pub backfill_fids: Option<FidList>,

    /// Overrides the hub's highest registered identity.
    pub max_fid: Option<u64>,

    #[envconfig(default = "10")]
    pub batch_size: usize,

    #[envconfig(default = "3")]
    pub max_attempts: i32,

    /// Run a worker in this process until the queue is empty.
    #[envconfig(default = "false")]
    pub drain_after_enqueue: bool,

    #[envconfig(nested = true)]
    pub worker: shuttle_worker::config::Config,
}
