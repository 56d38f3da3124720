//! Shard management module
//!
//! A shard is one gateway connection; a cluster is the set of shards one
//! process runs behind a shared identify lock.

mod backoff;
mod cluster;
mod connection;
mod identify;
mod processor;
mod session;
mod state;

pub use backoff::{Backoff, BackoffPolicy, BackoffStep};
pub use cluster::{ClusterConfig, ShardCluster, SHARDS_PER_POOL};
pub use connection::{Shard, ShardBuilder};
pub use identify::{IdentifyLock, IdentifyPermit, DEFAULT_IDENTIFY_COOLDOWN};
pub use processor::Processor;
pub use session::SessionState;
pub use state::{ShardPhase, ShardState, ShardStateEntry};
