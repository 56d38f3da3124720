//! Shard metrics
//!
//! Recording goes through the `metrics` facade, so shards record without a
//! handle and recording is a no-op until the binary installs the exporter.

use crate::error::GatewayError;
use crate::shard::ShardPhase;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Metric names exported by the gateway
pub mod names {
    pub const FRAMES_RECEIVED: &str = "gateway_frames_received_total";
    pub const EVENTS_DISPATCHED: &str = "gateway_events_dispatched_total";
    pub const DISPATCH_FAILURES: &str = "gateway_dispatch_failures_total";
    pub const RECONNECTS: &str = "gateway_reconnects_total";
    pub const ERRORS: &str = "gateway_errors_total";
    pub const DISPATCH_DURATION: &str = "gateway_dispatch_duration_seconds";
    pub const HEARTBEAT_LATENCY: &str = "gateway_heartbeat_latency_seconds";
    pub const SHARD_PHASE: &str = "gateway_shard_phase";
    pub const SHARDS_READY: &str = "gateway_shards_ready";
    pub const LAST_HEARTBEAT: &str = "gateway_last_heartbeat_timestamp";
    pub const NATS_CONNECTED: &str = "gateway_nats_connected";
}

const SHARD_LABEL: &str = "shard_id";

/// Handle to the process-wide Prometheus recorder
#[derive(Clone)]
pub struct GatewayMetrics {
    handle: PrometheusHandle,
}

impl GatewayMetrics {
    /// Install the global Prometheus recorder. Call once per process.
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::Config(format!("failed to install Prometheus recorder: {e}")))?;

        describe();
        Ok(Self { handle })
    }

    /// Prometheus text exposition of everything recorded so far
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe() {
    use names::*;

    describe_counter!(FRAMES_RECEIVED, Unit::Count, "Inbound gateway frames by opcode");
    describe_counter!(EVENTS_DISPATCHED, Unit::Count, "Dispatch events delivered to the dispatcher");
    describe_counter!(
        DISPATCH_FAILURES,
        Unit::Count,
        "Dispatch events the dispatcher failed or timed out on"
    );
    describe_counter!(RECONNECTS, Unit::Count, "Reconnects performed by the supervising loop");
    describe_counter!(ERRORS, Unit::Count, "Shard errors by kind");

    describe_histogram!(
        DISPATCH_DURATION,
        Unit::Seconds,
        "Time spent delivering one event to the dispatcher"
    );
    describe_histogram!(HEARTBEAT_LATENCY, Unit::Seconds, "Heartbeat round trip");

    describe_gauge!(SHARD_PHASE, Unit::Count, "Current life cycle phase of each shard");
    describe_gauge!(SHARDS_READY, Unit::Count, "Shards of the pool in steady state");
    describe_gauge!(
        LAST_HEARTBEAT,
        Unit::Seconds,
        "Unix time of the last heartbeat acknowledgement"
    );
    describe_gauge!(NATS_CONNECTED, Unit::Count, "1 while the NATS client is connected");
}

pub fn record_frame(shard_id: u32, op: u64) {
    counter!(names::FRAMES_RECEIVED, SHARD_LABEL => shard_id.to_string(), "op" => op.to_string())
        .increment(1);
}

/// Record one delivered event and how long delivery took
pub fn record_dispatch(shard_id: u32, duration: Duration) {
    let shard = shard_id.to_string();
    counter!(names::EVENTS_DISPATCHED, SHARD_LABEL => shard.clone()).increment(1);
    histogram!(names::DISPATCH_DURATION, SHARD_LABEL => shard).record(duration.as_secs_f64());
}

pub fn record_dispatch_failure(shard_id: u32) {
    counter!(names::DISPATCH_FAILURES, SHARD_LABEL => shard_id.to_string()).increment(1);
}

/// Record a reconnect and whether it will resume
pub fn record_reconnect(shard_id: u32, resume: bool) {
    let resume = if resume { "true" } else { "false" };
    counter!(names::RECONNECTS, SHARD_LABEL => shard_id.to_string(), "resume" => resume).increment(1);
}

/// Count an error under its `error_type_label`
pub fn record_error(shard_id: u32, error_type: &'static str) {
    counter!(names::ERRORS, SHARD_LABEL => shard_id.to_string(), "error_type" => error_type)
        .increment(1);
}

/// Record an acknowledged heartbeat
pub fn record_heartbeat(shard_id: u32, latency: Duration) {
    let shard = shard_id.to_string();
    histogram!(names::HEARTBEAT_LATENCY, SHARD_LABEL => shard.clone()).record(latency.as_secs_f64());

    let acked_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64());
    gauge!(names::LAST_HEARTBEAT, SHARD_LABEL => shard).set(acked_at);
}

pub fn set_phase(shard_id: u32, phase: ShardPhase) {
    gauge!(names::SHARD_PHASE, SHARD_LABEL => shard_id.to_string()).set(f64::from(phase as u8));
}

pub fn set_shards_ready(pool_id: u64, count: usize) {
    gauge!(names::SHARDS_READY, "pool_id" => pool_id.to_string()).set(count as f64);
}

pub fn set_nats_connected(connected: bool) {
    gauge!(names::NATS_CONNECTED).set(if connected { 1.0 } else { 0.0 });
}
