//! Liveness, readiness and scrape endpoints
//!
//! `/health` answers as long as the process runs, `/ready` once at least one
//! shard has an established session, `/metrics` renders Prometheus text.

use crate::dispatch::NatsDispatcher;
use crate::metrics::{self, GatewayMetrics};
use crate::shard::ShardState;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct Liveness {
    pub status: &'static str,
    pub version: &'static str,
    pub pool_id: u64,
}

/// Per-pool session and delivery summary
#[derive(Debug, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub pool_id: u64,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub shards_healthy: usize,
    pub events_received: u64,
    pub events_dispatched: u64,
    pub dispatch_failures: u64,
}

impl Readiness {
    fn of(shards: &ShardState) -> Self {
        Self {
            ready: shards.is_ready(),
            pool_id: shards.pool_id(),
            shards_total: shards.shard_count(),
            shards_ready: shards.ready_shards(),
            shards_healthy: shards.healthy_shards(),
            events_received: shards.total_events_received(),
            events_dispatched: shards.total_events_dispatched(),
            dispatch_failures: shards.total_dispatch_failures(),
        }
    }
}

/// Shared by every endpoint handler
#[derive(Clone)]
pub struct HealthState {
    pub shards: ShardState,
    /// Reported as the NATS gauge on scrape
    pub nats: Option<Arc<NatsDispatcher>>,
    /// `None` serves an empty scrape
    pub metrics: Option<GatewayMetrics>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(live))
        .route("/ready", get(ready))
        .route("/metrics", get(scrape))
        .with_state(state)
}

async fn live(State(state): State<HealthState>) -> Json<Liveness> {
    Json(Liveness {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        pool_id: state.shards.pool_id(),
    })
}

async fn ready(State(state): State<HealthState>) -> Response {
    let readiness = Readiness::of(&state.shards);
    let status = match readiness.ready {
        true => StatusCode::OK,
        false => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(readiness)).into_response()
}

async fn scrape(State(state): State<HealthState>) -> Response {
    metrics::set_shards_ready(state.shards.pool_id(), state.shards.ready_shards());
    if let Some(nats) = &state.nats {
        metrics::set_nats_connected(nats.is_connected());
    }

    let body = state
        .metrics
        .as_ref()
        .map(GatewayMetrics::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardPhase;

    fn state() -> HealthState {
        HealthState {
            shards: ShardState::new(1, 25..27, 50),
            nats: None,
            metrics: None,
        }
    }

    #[tokio::test]
    async fn ready_requires_a_steady_shard() {
        let state = state();
        assert_eq!(
            ready(State(state.clone())).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.shards.set_phase(26, ShardPhase::Steady);
        assert_eq!(ready(State(state)).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn liveness_reports_pool() {
        let Json(body) = live(State(state())).await;
        assert_eq!(body.status, "healthy");
        assert_eq!(body.pool_id, 1);
    }

    #[tokio::test]
    async fn scrape_without_recorder_is_empty() {
        let response = scrape(State(state())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }

    #[test]
    fn readiness_counts_pool_shards() {
        let shards = ShardState::new(0, 0..3, 3);
        shards.set_phase(0, ShardPhase::Steady);
        shards.set_phase(1, ShardPhase::Exhausted);

        let readiness = Readiness::of(&shards);
        assert!(readiness.ready);
        assert_eq!(readiness.shards_total, 3);
        assert_eq!(readiness.shards_ready, 1);

        let json = serde_json::to_value(&readiness).unwrap();
        assert_eq!(json["shards_total"], 3);
        assert_eq!(json["dispatch_failures"], 0);
    }
}
