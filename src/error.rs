//! Domain error types for the shard gateway
//!
//! Structured thiserror types so every failure of the connection engine can be
//! pattern-matched by the supervising loop instead of parsed from strings.
//!
//! Library code returns `Result<T, GatewayError>`; anyhow only appears in the
//! binary.

use std::time::Duration;
use thiserror::Error;

/// Boxed source error carried by transport-level variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Close codes the platform sends when it refuses the session itself
/// (bad token, shard pair, version or intents). Retrying cannot succeed
/// until an operator intervenes.
const REJECTED_CLOSE_CODES: [u16; 6] = [4004, 4010, 4011, 4012, 4013, 4014];

/// Errors raised by shards, clusters and their configuration
///
/// Variants are grouped by how the shard reacts to them:
/// transport, decode, sequencing, session and liveness errors end the current
/// connection and feed the reconnect loop; backoff exhaustion ends the shard.
///
/// Example log output:
/// ```text
/// GatewayError::BackoffExhausted { shard_id: 3, attempts: 14, .. }
/// → "shard 3 gave up connecting after 14 attempts over 180.2s"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Dial, TLS or upgrade failure while opening the connection
    #[error("failed to connect to {url}")]
    Connect {
        url: String,
        #[source]
        source: BoxError,
    },

    /// A single connect attempt did not finish in time
    #[error("connect attempt to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    /// Read or write failure on an open connection
    #[error("transport error")]
    Transport(#[source] BoxError),

    /// The connection was closed, by the peer (with a close frame) or locally
    #[error("connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    /// Write attempted while no connection is open
    #[error("connection is not open")]
    NotConnected,

    /// A compressed binary frame could not be inflated
    #[error("failed to decompress binary frame")]
    Decompress(#[source] std::io::Error),

    /// Malformed envelope or control payload
    #[error("failed to decode gateway payload")]
    Decode(#[from] serde_json::Error),

    /// A non-Hello opcode arrived before Hello
    #[error("shard {shard_id} received opcode {op} before hello")]
    ProtocolViolation { shard_id: u32, op: u64 },

    /// The peer asked for a reconnect (the next attempt resumes)
    #[error("shard {shard_id} was asked to reconnect")]
    ReconnectRequested { shard_id: u32 },

    /// The peer invalidated the session (the next attempt identifies)
    #[error("shard {shard_id} session was invalidated")]
    SessionInvalidated { shard_id: u32 },

    /// The last heartbeat was never acknowledged
    #[error("shard {shard_id} missed a heartbeat acknowledgement")]
    HeartbeatMissed { shard_id: u32 },

    /// A packet processor panicked; converted at the shard boundary
    #[error("shard {shard_id} packet processing panicked")]
    ProcessorPanicked { shard_id: u32 },

    /// Connect backoff budget exceeded; the shard stops
    #[error("shard {shard_id} gave up connecting after {attempts} attempts over {elapsed:.1?}")]
    BackoffExhausted {
        shard_id: u32,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<GatewayError>,
    },

    /// Every shard in a cluster stopped permanently
    #[error("all {shards} shards of pool {pool_id} stopped")]
    ClusterExhausted { pool_id: u64, shards: usize },

    /// Shard index/count pair is not valid
    #[error("invalid shard {index} of {count}")]
    InvalidShard { index: u64, count: u64 },

    /// Shard count cannot be evenly partitioned by the identify concurrency
    #[error("shard count {shard_count} is not a multiple of concurrency {concurrency}")]
    InvalidPartition { shard_count: u64, concurrency: u64 },

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] BoxError),

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total`.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::Transport(_) => "transport",
            Self::Closed { .. } => "closed",
            Self::NotConnected => "not_connected",
            Self::Decompress(_) => "decompress",
            Self::Decode(_) => "decode",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::ReconnectRequested { .. } => "reconnect_requested",
            Self::SessionInvalidated { .. } => "session_invalidated",
            Self::HeartbeatMissed { .. } => "heartbeat_missed",
            Self::ProcessorPanicked { .. } => "processor_panicked",
            Self::BackoffExhausted { .. } => "backoff_exhausted",
            Self::ClusterExhausted { .. } => "cluster_exhausted",
            Self::InvalidShard { .. } => "invalid_shard",
            Self::InvalidPartition { .. } => "invalid_partition",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::Config(_) => "config",
        }
    }

    /// True when the error must not be retried by the shard's supervising loop.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::BackoffExhausted { .. }
            | Self::ClusterExhausted { .. }
            | Self::InvalidShard { .. }
            | Self::InvalidPartition { .. }
            | Self::Config(_) => true,
            _ => false,
        }
    }

    /// True when the peer closed with a code that rejects the session.
    /// The shard keeps reconnecting on a backoff delay and logs these at error.
    pub fn is_rejected_close(&self) -> bool {
        matches!(self, Self::Closed { code: Some(code), .. } if REJECTED_CLOSE_CODES.contains(code))
    }

    /// True for session transitions requested by the peer; these are logged
    /// at info rather than warn.
    pub fn is_session_transition(&self) -> bool {
        matches!(
            self,
            Self::ReconnectRequested { .. } | Self::SessionInvalidated { .. }
        )
    }
}
