//! Shard Gateway
//!
//! Runs one pool of gateway shards:
//! - Manages multiple shards per process behind one identify lock
//! - Publishes dispatch events to NATS JetStream (or logs them locally)
//! - Exposes health/ready endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::{Context, Result};
use shard_gateway::dispatch::{Dispatcher, HandlerTable, NatsDispatcher};
use shard_gateway::health::{self, HealthState};
use shard_gateway::metrics::{self, GatewayMetrics};
use shard_gateway::{GatewayConfig, ShardCluster};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // configuration carries the log level, so it comes before tracing
    let gateway_config = GatewayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("shard_gateway={}", gateway_config.log_level).parse()?)
                .add_directive("async_nats=warn".parse()?)
                .add_directive("tungstenite=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pool_id = gateway_config.pool_id,
        "Starting Shard Gateway"
    );

    let gateway_metrics = GatewayMetrics::install()?;
    info!("Prometheus metrics initialized");

    let nats = if let Some(ref url) = gateway_config.nats_url {
        match NatsDispatcher::connect(url).await {
            Ok(publisher) => {
                metrics::set_nats_connected(true);
                Some(publisher)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - running in local mode");
                metrics::set_nats_connected(false);
                None
            }
        }
    } else {
        info!("No NATS_URL configured - running in local mode");
        None
    };

    let dispatcher: Arc<dyn Dispatcher> = match nats {
        Some(ref nats) => Arc::clone(nats) as Arc<dyn Dispatcher>,
        None => Arc::new(HandlerTable::new().fallback(|event, data| {
            debug!(event, bytes = data.len(), "Event received");
            Ok(())
        })),
    };

    let (gateway_url, total_shards, concurrency) = resolve_endpoint(&gateway_config).await?;
    info!(
        gateway_url = %gateway_url,
        total_shards,
        concurrency,
        intents = ?gateway_config.intents(),
        "Gateway endpoint resolved"
    );

    let shard_config = gateway_config.shard_config(gateway_url)?;
    let cluster_config = gateway_config.cluster_config(total_shards, concurrency, shard_config);
    let cluster = Arc::new(ShardCluster::new(cluster_config, dispatcher)?);

    let cluster_state = cluster.state();
    info!(
        pool_id = cluster.pool_id(),
        shard_count = cluster_state.shard_count(),
        "Shard cluster created"
    );

    let health_router = health::router(HealthState {
        shards: cluster_state,
        nats: nats.clone(),
        metrics: Some(gateway_metrics),
    });
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP port {}", gateway_config.http_port))?;

    info!(port = gateway_config.http_port, "Starting HTTP server");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_router).await {
            error!(error = %e, "HTTP server error");
        }
    });

    {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            cluster.shutdown();
        });
    }

    let result = cluster.run().await;

    info!("Cluster stopped, draining NATS");

    if let Some(ref nats) = nats {
        nats.close().await;
    }

    result?;
    info!("Gateway shutdown complete");
    Ok(())
}

/// Gateway URL, shard count and identify concurrency; anything not
/// configured is taken from the bot gateway REST endpoint.
async fn resolve_endpoint(config: &GatewayConfig) -> Result<(String, u64, u64)> {
    if let (Some(url), Some(total), Some(concurrency)) = (
        config.gateway_url.as_ref(),
        config.total_shards,
        config.max_concurrency,
    ) {
        return Ok((url.clone(), total, concurrency));
    }

    let client = twilight_http::Client::new(config.discord_token.clone());
    let info = client
        .gateway()
        .authed()
        .await
        .context("failed to fetch bot gateway information")?
        .model()
        .await
        .context("failed to decode bot gateway information")?;

    debug!(
        url = %info.url,
        shards = info.shards,
        max_concurrency = info.session_start_limit.max_concurrency,
        remaining = info.session_start_limit.remaining,
        "Bot gateway information received"
    );

    Ok((
        config.gateway_url.clone().unwrap_or(info.url),
        config.total_shards.unwrap_or(u64::from(info.shards)),
        config
            .max_concurrency
            .unwrap_or(u64::from(info.session_start_limit.max_concurrency)),
    ))
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
