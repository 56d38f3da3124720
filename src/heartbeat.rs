//! Heartbeat liveness monitor
//!
//! One monitor is created per Hello and bound to a single connection. It
//! beats on a fixed cadence independent of inbound traffic; if a tick finds
//! the previous heartbeat still unacknowledged it asks its target to drop the
//! connection and stops itself. At most one heartbeat is ever outstanding.

use crate::error::GatewayError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// The side of a shard a heartbeat monitor drives
#[async_trait]
pub trait HeartbeatTarget: Send + Sync + 'static {
    /// Send one heartbeat through the rate-limited send path
    async fn send_heartbeat(&self) -> Result<(), GatewayError>;

    /// The previous heartbeat was never acknowledged; tear the connection down
    async fn heartbeat_missed(&self);
}

/// Monitor life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl MonitorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

pub struct HeartbeatMonitor {
    shard_id: u32,
    interval: Duration,
    ack_pending: AtomicBool,
    last_sent_at: Mutex<Option<Instant>>,
    latency: Mutex<Option<Duration>>,
    state: AtomicU8,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// `interval` comes from the peer's Hello and is not configurable
    pub fn new(shard_id: u32, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            shard_id,
            interval,
            ack_pending: AtomicBool::new(false),
            last_sent_at: Mutex::new(None),
            latency: Mutex::new(None),
            state: AtomicU8::new(MonitorState::Idle as u8),
            task: Mutex::new(None),
        })
    }

    /// Begin beating. Only the first call on an idle monitor has any effect.
    pub fn start<T: HeartbeatTarget>(self: &Arc<Self>, target: Weak<T>) {
        if self
            .state
            .compare_exchange(
                MonitorState::Idle as u8,
                MonitorState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            monitor.beat(target).await;
            monitor.state.store(MonitorState::Stopped as u8, Ordering::SeqCst);
        });
        *self.task.lock() = Some(handle);
    }

    async fn beat<T: HeartbeatTarget>(&self, target: Weak<T>) {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(shard_id = self.shard_id, interval_ms = self.interval.as_millis() as u64, "Heartbeat started");

        loop {
            ticker.tick().await;
            if self.is_stopped() {
                return;
            }
            let Some(target) = target.upgrade() else {
                return;
            };

            if self.ack_pending.load(Ordering::SeqCst) {
                warn!(shard_id = self.shard_id, "Heartbeat not acknowledged, dropping connection");
                self.state.store(MonitorState::Stopped as u8, Ordering::SeqCst);
                target.heartbeat_missed().await;
                return;
            }

            // Marked before the write so an ack racing the send is never lost
            *self.last_sent_at.lock() = Some(Instant::now());
            self.ack_pending.store(true, Ordering::SeqCst);

            if let Err(e) = target.send_heartbeat().await {
                debug!(shard_id = self.shard_id, error = %e, "Heartbeat send failed, stopping");
                return;
            }
        }
    }

    /// Record the acknowledgement of the outstanding heartbeat
    pub fn ack(&self) -> Option<Duration> {
        self.ack_pending.store(false, Ordering::SeqCst);
        let sent = (*self.last_sent_at.lock())?;
        let latency = sent.elapsed();
        *self.latency.lock() = Some(latency);
        Some(latency)
    }

    /// Cancel the timer. Safe before `start` and after self-termination.
    pub fn stop(&self) {
        self.state.store(MonitorState::Stopped as u8, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == MonitorState::Stopped
    }

    pub fn is_ack_pending(&self) -> bool {
        self.ack_pending.load(Ordering::SeqCst)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Round trip of the most recently acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        *self.latency.lock()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Target {
        sent: AtomicUsize,
        missed: AtomicUsize,
    }

    #[async_trait]
    impl HeartbeatTarget for Target {
        async fn send_heartbeat(&self) -> Result<(), GatewayError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn heartbeat_missed(&self) {
            self.missed.fetch_add(1, Ordering::SeqCst);
        }
    }

    const INTERVAL: Duration = Duration::from_millis(1000);

    #[tokio::test(start_paused = true)]
    async fn beats_on_cadence_while_acked() {
        let target = Arc::new(Target::default());
        let monitor = HeartbeatMonitor::new(0, INTERVAL);
        monitor.start(Arc::downgrade(&target));
        assert_eq!(monitor.state(), MonitorState::Running);

        time::sleep(INTERVAL / 2).await;
        assert_eq!(target.sent.load(Ordering::SeqCst), 0, "first beat waits one interval");

        for expected in 1..=3 {
            time::sleep(INTERVAL).await;
            assert_eq!(target.sent.load(Ordering::SeqCst), expected);
            assert!(monitor.is_ack_pending());
            assert!(monitor.ack().is_some());
        }
        assert_eq!(target.missed.load(Ordering::SeqCst), 0);
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ack_terminates_connection_and_stops() {
        let target = Arc::new(Target::default());
        let monitor = HeartbeatMonitor::new(0, INTERVAL);
        monitor.start(Arc::downgrade(&target));

        // first beat goes out, never acked
        time::sleep(INTERVAL + INTERVAL / 2).await;
        assert_eq!(target.sent.load(Ordering::SeqCst), 1);

        // next tick finds it outstanding
        time::sleep(INTERVAL).await;
        assert_eq!(target.missed.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.state(), MonitorState::Stopped);

        // no further beats on this connection
        time::sleep(INTERVAL * 5).await;
        assert_eq!(target.sent.load(Ordering::SeqCst), 1);
        assert_eq!(target.missed.load(Ordering::SeqCst), 1);

        // stopping after self-termination is a no-op
        monitor.stop();
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn ack_records_latency() {
        let target = Arc::new(Target::default());
        let monitor = HeartbeatMonitor::new(3, INTERVAL);
        assert!(monitor.ack().is_none(), "no beat sent yet");

        monitor.start(Arc::downgrade(&target));
        time::sleep(INTERVAL + Duration::from_millis(1)).await;
        time::sleep(Duration::from_millis(40)).await;

        let latency = monitor.ack().unwrap();
        assert!(latency >= Duration::from_millis(40));
        assert_eq!(monitor.latency(), Some(latency));
        assert!(!monitor.is_ack_pending());
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_start_is_safe() {
        let target = Arc::new(Target::default());
        let monitor = HeartbeatMonitor::new(0, INTERVAL);
        monitor.stop();
        assert_eq!(monitor.state(), MonitorState::Stopped);

        monitor.start(Arc::downgrade(&target));
        time::sleep(INTERVAL * 3).await;
        assert_eq!(target.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_target_ends_monitor() {
        let target = Arc::new(Target::default());
        let monitor = HeartbeatMonitor::new(0, INTERVAL);
        monitor.start(Arc::downgrade(&target));
        drop(target);

        time::sleep(INTERVAL * 2).await;
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }
}
