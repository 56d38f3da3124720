//! Sharded gateway client
//!
//! Connection engine for a sharded real-time gateway: the wire transport,
//! payload codec, heartbeat monitor, packet processors, the shard life cycle
//! and a cluster that coordinates session starts across shards. Decoded
//! dispatch events leave through the `Dispatcher` boundary.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod protocol;
pub mod ratelimit;
pub mod shard;
pub mod transport;

pub use config::{GatewayConfig, ShardConfig};
pub use dispatch::{DispatchError, Dispatcher, HandlerTable, NatsDispatcher};
pub use error::GatewayError;
pub use shard::{
    ClusterConfig, IdentifyLock, Shard, ShardBuilder, ShardCluster, ShardPhase, ShardState,
};
pub use transport::{MemoryTransport, Transport, WebSocketTransport};
