//! Shard cluster
//!
//! Owns the contiguous range of shards assigned to one process (a pool),
//! gives all of them one shared identify lock and supervises their `run`
//! loops until shutdown.

use super::connection::{Shard, ShardBuilder};
use super::identify::IdentifyLock;
use super::state::ShardState;
use crate::config::ShardConfig;
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::transport::{Transport, WebSocketTransport};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{error, info, warn};
use twilight_model::gateway::ShardId;

/// Default width of one pool
pub const SHARDS_PER_POOL: u64 = 25;

/// Time shards get to finish after being closed on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Layout of one cluster
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub pool_id: u64,
    pub shards_per_pool: u64,
    /// Total shards across every pool
    pub total_shards: u64,
    /// Sessions the platform lets this bot start concurrently
    pub concurrency: u64,
    pub identify_cooldown: Duration,
    /// Settings every shard of the cluster is built with
    pub shard: ShardConfig,
}

impl ClusterConfig {
    /// Shard indices owned by this pool
    pub fn shard_range(&self) -> Range<u64> {
        let start = self.pool_id.saturating_mul(self.shards_per_pool);
        let end = start
            .saturating_add(self.shards_per_pool)
            .min(self.total_shards);
        start..end.max(start)
    }

    fn validate(&self) -> Result<Range<u32>, GatewayError> {
        if self.concurrency == 0 || self.total_shards % self.concurrency != 0 {
            return Err(GatewayError::InvalidPartition {
                shard_count: self.total_shards,
                concurrency: self.concurrency,
            });
        }

        let range = self.shard_range();
        let invalid = || GatewayError::InvalidShard {
            index: range.start,
            count: self.total_shards,
        };
        if range.is_empty() || u32::try_from(self.total_shards).is_err() {
            return Err(invalid());
        }

        let start = u32::try_from(range.start).map_err(|_| invalid())?;
        let end = u32::try_from(range.end).map_err(|_| invalid())?;
        Ok(start..end)
    }
}

/// Shards of one process sharing an identify lock
pub struct ShardCluster {
    pool_id: u64,
    shards: Vec<Arc<Shard>>,
    identify_lock: IdentifyLock,
    state: ShardState,
    shutdown_tx: watch::Sender<bool>,
}

impl ShardCluster {
    /// Create a cluster connecting over TLS WebSockets
    pub fn new(config: ClusterConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self, GatewayError> {
        Self::with_transports(config, dispatcher, |_| Arc::new(WebSocketTransport::new()))
    }

    /// Create a cluster whose shards use the transports `transport` returns
    pub fn with_transports<F>(
        config: ClusterConfig,
        dispatcher: Arc<dyn Dispatcher>,
        mut transport: F,
    ) -> Result<Self, GatewayError>
    where
        F: FnMut(ShardId) -> Arc<dyn Transport>,
    {
        let range = config.validate()?;
        // validate() guarantees the count fits
        let total = u32::try_from(config.total_shards).map_err(|_| GatewayError::InvalidShard {
            index: 0,
            count: config.total_shards,
        })?;

        info!(
            pool_id = config.pool_id,
            start_shard = range.start,
            end_shard = range.end,
            shard_count = range.len(),
            concurrency = config.concurrency,
            "Creating shard cluster"
        );

        let state = ShardState::new(config.pool_id, range.clone(), config.total_shards);
        let identify_lock = IdentifyLock::new(config.identify_cooldown);

        let mut shards = Vec::with_capacity(range.len());
        for number in range {
            let id = ShardId::new_checked(number, total).ok_or(GatewayError::InvalidShard {
                index: u64::from(number),
                count: config.total_shards,
            })?;

            let shard = ShardBuilder::with_config(id, config.shard.clone())
                .transport(transport(id))
                .dispatcher(Arc::clone(&dispatcher))
                .identify_lock(identify_lock.clone())
                .state(state.clone())
                .build();
            shards.push(shard);
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            pool_id: config.pool_id,
            shards,
            identify_lock,
            state,
            shutdown_tx,
        })
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Registry every shard of the cluster reports into
    pub fn state(&self) -> ShardState {
        self.state.clone()
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    pub fn identify_lock(&self) -> &IdentifyLock {
        &self.identify_lock
    }

    /// Run every shard until `shutdown` is called.
    ///
    /// Shards that stop on their own are logged and left stopped. Fails with
    /// `ClusterExhausted` if every shard stops before shutdown.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let mut tasks = JoinSet::new();
        for shard in &self.shards {
            let shard = Arc::clone(shard);
            tasks.spawn(async move {
                let shard_id = shard.id().number();
                (shard_id, shard.run().await)
            });
        }

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                joined = tasks.join_next() => match joined {
                    Some(Ok((shard_id, Ok(())))) => info!(shard_id, "Shard task finished"),
                    Some(Ok((shard_id, Err(e)))) => {
                        error!(shard_id, error = %e, "Shard stopped permanently");
                    }
                    Some(Err(e)) => error!(error = %e, "Shard task failed"),
                    None => {
                        error!(pool_id = self.pool_id, "Every shard in the cluster has stopped");
                        return Err(GatewayError::ClusterExhausted {
                            pool_id: self.pool_id,
                            shards: self.shards.len(),
                        });
                    }
                },
            }
        }

        info!(pool_id = self.pool_id, "Closing shards");
        for shard in &self.shards {
            shard.close().await;
        }

        let drained = time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(pool_id = self.pool_id, remaining = tasks.len(), "Aborting shards after shutdown grace");
            tasks.abort_all();
        }

        info!(pool_id = self.pool_id, "Shard cluster shut down");
        Ok(())
    }

    /// Ask `run` to close every shard and return
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|requested| *requested).await;
}
