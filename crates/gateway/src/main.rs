//! sqlgate gateway - main entry point
//!
//! Boots the routing core, the cluster health monitor and the admin endpoint.

use anyhow::Context;
use sqlgate_common::GatewayConfig;
use sqlgate_gateway::admin::{start_admin_server, AdminState};
use sqlgate_gateway::monitor::stats_source_from_config;
use sqlgate_gateway::{
    BackendRegistry, BoundedQueryHistory, ClusterStatsBoard, ClusterStatsObserver, HealthMonitor,
    HttpQueryProbe, InMemoryAffinityStore, MetricsObserver, MonitorOptions, RequestRouter,
    RoutingEngine, RoutingGroupSelector, RoutingOptions, StaticBackendRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path =
        std::env::var("SQLGATE_CONFIG").unwrap_or_else(|_| "configs/gateway.yaml".to_string());
    let config = GatewayConfig::from_file(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "sqlgate_gateway={level},sqlgate_common={level}",
                    level = config.observability.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting sqlgate gateway: bind={}, backends={}",
        config.bind_address,
        config.backends.len()
    );

    // Routing core
    let registry = Arc::new(StaticBackendRegistry::from_config(&config.backends));
    let store = Arc::new(InMemoryAffinityStore::new());
    let probe = Arc::new(HttpQueryProbe::new(config.probe_timeout())?);
    let engine = Arc::new(RoutingEngine::new(
        registry.clone(),
        store,
        probe,
        RoutingOptions::from_config(&config),
    ));
    let history = Arc::new(BoundedQueryHistory::new(config.history_size));
    let router = RequestRouter::new(
        engine,
        RoutingGroupSelector::from_config(&config.routing_rules),
        history.clone(),
        config.pending_ttl(),
    );
    info!(
        "Request router ready: {} active backends, affinity mode {:?}",
        registry.list_active().len(),
        router.engine().mode()
    );

    // Health monitor
    let board = Arc::new(ClusterStatsBoard::new());
    let mut observers: Vec<Arc<dyn ClusterStatsObserver>> = vec![board.clone()];
    if config.observability.enable_metrics {
        observers.push(Arc::new(MetricsObserver));
    }
    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        stats_source_from_config(&config)?,
        observers,
        MonitorOptions::from_config(&config),
    ));
    let monitor_handle = monitor.start();

    // Admin endpoint
    let admin_addr: SocketAddr = format!(
        "{}:{}",
        config.bind_address, config.observability.metrics_port
    )
    .parse()
    .context("parsing admin address")?;
    let admin_state = Arc::new(AdminState { board, history });
    let admin_handle = tokio::spawn(start_admin_server(admin_addr, admin_state));

    info!("sqlgate gateway running");

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = admin_handle => {
            match result {
                Ok(Err(e)) => error!("Admin endpoint failed: {}", e),
                Err(e) => error!("Admin endpoint task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    monitor.stop();
    monitor_handle.await?;

    info!("sqlgate gateway shutdown complete");
    Ok(())
}
