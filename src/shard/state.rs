//! Shard phase tracking
//!
//! Each shard holds its current phase atomically and mirrors it, together
//! with delivery counters, into a `ShardState` registry shared by the
//! cluster. The registry feeds the health endpoints and metrics.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connection life cycle phase of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShardPhase {
    /// No connection and none being attempted
    Disconnected = 0,
    /// Opening the transport (possibly backing off)
    Connecting = 1,
    /// Connected, waiting for Hello
    AwaitingHello = 2,
    /// Identify in progress or sent
    Identifying = 3,
    /// Resume in progress or sent
    Resuming = 4,
    /// Session established, receiving events
    Steady = 5,
    /// Closed by its owner
    Closing = 6,
    /// Connection lost; the supervising loop will reconnect
    Faulted = 7,
    /// Stopped for good: backoff budget spent or a non-recoverable close
    Exhausted = 8,
}

impl ShardPhase {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::AwaitingHello,
            3 => Self::Identifying,
            4 => Self::Resuming,
            5 => Self::Steady,
            6 => Self::Closing,
            7 => Self::Faulted,
            8 => Self::Exhausted,
            _ => Self::Disconnected,
        }
    }

    /// Returns true if the shard is connected or recovering
    pub fn is_healthy(&self) -> bool {
        !matches!(self, Self::Disconnected | Self::Closing | Self::Exhausted)
    }

    /// Returns true if the shard is ready to receive events
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Steady)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHello => "awaiting_hello",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Steady => "steady",
            Self::Closing => "closing",
            Self::Faulted => "faulted",
            Self::Exhausted => "exhausted",
        }
    }
}

/// Registry slot of one shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub phase: ShardPhase,
    pub events_received: AtomicU64,
    pub events_dispatched: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_heartbeat: Option<Instant>,
    pub heartbeat_latency: Option<Duration>,
    pub connected_at: Option<Instant>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            phase: ShardPhase::Disconnected,
            events_received: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_heartbeat: None,
            heartbeat_latency: None,
            connected_at: None,
        }
    }
}

/// Phases and counters of every shard in a pool, shared by clone
#[derive(Debug, Clone)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug)]
struct ShardStateInner {
    pool_id: u64,
    shards: DashMap<u32, ShardStateEntry>,
    total_shards: u64,
}

impl ShardState {
    /// Registry with every shard of `shard_ids` disconnected
    pub fn new(pool_id: u64, shard_ids: impl Iterator<Item = u32>, total_shards: u64) -> Self {
        let shards = DashMap::new();
        for shard_id in shard_ids {
            shards.insert(shard_id, ShardStateEntry::default());
        }

        Self {
            inner: Arc::new(ShardStateInner {
                pool_id,
                shards,
                total_shards,
            }),
        }
    }

    pub fn pool_id(&self) -> u64 {
        self.inner.pool_id
    }

    /// Shards across every pool
    pub fn total_shards(&self) -> u64 {
        self.inner.total_shards
    }

    /// Mirror a phase change; tracks when the shard last became steady
    pub fn set_phase(&self, shard_id: u32, phase: ShardPhase) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.phase = phase;
            match phase {
                ShardPhase::Steady if entry.connected_at.is_none() => {
                    entry.connected_at = Some(Instant::now());
                }
                ShardPhase::Faulted | ShardPhase::Disconnected | ShardPhase::Exhausted => {
                    entry.connected_at = None;
                }
                _ => {}
            }
        }
    }

    /// Count one inbound frame
    pub fn record_event(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dispatch(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_dispatched.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dispatch_failure(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.dispatch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reconnect(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an acknowledged heartbeat and its round trip
    pub fn record_heartbeat(&self, shard_id: u32, latency: Duration) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.last_heartbeat = Some(Instant::now());
            entry.heartbeat_latency = Some(latency);
        }
    }

    pub fn get_phase(&self, shard_id: u32) -> Option<ShardPhase> {
        self.inner.shards.get(&shard_id).map(|e| e.phase)
    }

    /// Last measured heartbeat round trip
    pub fn heartbeat_latency(&self, shard_id: u32) -> Option<Duration> {
        self.inner.shards.get(&shard_id).and_then(|e| e.heartbeat_latency)
    }

    /// Time since the shard last became steady, while it still is
    pub fn steady_for(&self, shard_id: u32) -> Option<Duration> {
        self.inner
            .shards
            .get(&shard_id)
            .and_then(|e| e.connected_at)
            .map(|at| at.elapsed())
    }

    /// Time since the last acknowledged heartbeat
    pub fn since_heartbeat(&self, shard_id: u32) -> Option<Duration> {
        self.inner
            .shards
            .get(&shard_id)
            .and_then(|e| e.last_heartbeat)
            .map(|at| at.elapsed())
    }

    fn sum(&self, counter: impl Fn(&ShardStateEntry) -> &AtomicU64) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|entry| counter(entry.value()).load(Ordering::Relaxed))
            .sum()
    }

    fn count(&self, pred: impl Fn(ShardPhase) -> bool) -> usize {
        self.inner.shards.iter().filter(|entry| pred(entry.phase)).count()
    }

    pub fn total_events_received(&self) -> u64 {
        self.sum(|entry| &entry.events_received)
    }

    pub fn total_events_dispatched(&self) -> u64 {
        self.sum(|entry| &entry.events_dispatched)
    }

    pub fn total_dispatch_failures(&self) -> u64 {
        self.sum(|entry| &entry.dispatch_failures)
    }

    pub fn total_reconnects(&self) -> u64 {
        self.sum(|entry| &entry.reconnects)
    }

    /// Shards in steady state
    pub fn ready_shards(&self) -> usize {
        self.count(|phase| phase.is_ready())
    }

    /// Shards connected or on their way back
    pub fn healthy_shards(&self) -> usize {
        self.count(|phase| phase.is_healthy())
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// At least one shard can deliver events
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    /// No shard has stopped
    pub fn is_healthy(&self) -> bool {
        self.healthy_shards() == self.shard_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_survive_u8_conversion() {
        for phase in [
            ShardPhase::Disconnected,
            ShardPhase::AwaitingHello,
            ShardPhase::Steady,
            ShardPhase::Exhausted,
        ] {
            assert_eq!(ShardPhase::from_u8(phase as u8), phase);
        }
    }

    #[test]
    fn readiness_follows_steady_shards() {
        let state = ShardState::new(0, 0..3, 3);
        assert_eq!(state.shard_count(), 3);
        assert!(!state.is_ready());

        state.set_phase(1, ShardPhase::Steady);
        assert!(state.is_ready());
        assert_eq!(state.ready_shards(), 1);

        state.set_phase(0, ShardPhase::Faulted);
        state.set_phase(2, ShardPhase::Resuming);
        assert_eq!(state.healthy_shards(), 3);
        assert!(state.is_healthy());

        state.set_phase(2, ShardPhase::Exhausted);
        assert!(!state.is_healthy());
        assert_eq!(state.get_phase(2), Some(ShardPhase::Exhausted));
        assert!(state.steady_for(1).is_some());
        assert_eq!(state.steady_for(2), None);
    }

    #[test]
    fn unknown_shards_are_ignored() {
        let state = ShardState::new(0, 0..1, 1);
        state.set_phase(9, ShardPhase::Steady);
        state.record_event(9);
        assert_eq!(state.get_phase(9), None);
        assert_eq!(state.total_events_received(), 0);
    }

    #[test]
    fn counters_aggregate_across_shards() {
        let state = ShardState::new(2, 50..52, 100);
        state.record_event(50);
        state.record_event(51);
        state.record_dispatch(51);
        state.record_dispatch_failure(50);
        state.record_heartbeat(50, Duration::from_millis(42));
        state.record_reconnect(51);

        assert_eq!(state.pool_id(), 2);
        assert_eq!(state.total_events_received(), 2);
        assert_eq!(state.total_events_dispatched(), 1);
        assert_eq!(state.total_dispatch_failures(), 1);
        assert_eq!(state.total_reconnects(), 1);
        assert_eq!(state.heartbeat_latency(50), Some(Duration::from_millis(42)));
        assert!(state.since_heartbeat(50).is_some());
        assert_eq!(state.since_heartbeat(51), None);
    }
}
