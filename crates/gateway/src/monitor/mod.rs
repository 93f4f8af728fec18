//! Cluster health monitoring
//!
//! A background loop polls every active backend for load statistics once per
//! interval and publishes the fleet snapshot to registered observers.

pub mod catalog;
pub mod ui;

#[cfg(test)]
pub(crate) mod test_server;

pub use catalog::SystemCatalogStatsSource;
pub use ui::UiApiStatsSource;

use crate::backend::{Backend, BackendRegistry};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use sqlgate_common::error::{GatewayError, Result};
use sqlgate_common::{GatewayConfig, METRICS};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Load statistics of one cluster for one monitor cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterStats {
    pub cluster_id: String,
    pub proxy_to: String,
    pub external_url: String,
    pub routing_group: String,
    pub running_queries: u64,
    pub queued_queries: u64,
    pub blocked_queries: u64,
    pub active_workers: u64,

    /// Queued query count per user
    pub user_queued_count: BTreeMap<String, u64>,

    pub healthy: bool,
}

impl ClusterStats {
    /// Stats carrying the backend's identity and no load figures, marked unhealthy
    pub fn unhealthy(backend: &Backend) -> Self {
        Self {
            cluster_id: backend.name.clone(),
            proxy_to: backend.proxy_to.clone(),
            external_url: backend.external_url.clone(),
            routing_group: backend.routing_group.clone(),
            ..Self::default()
        }
    }
}

/// Telemetry transport for one backend
#[async_trait]
pub trait ClusterStatsSource: Send + Sync {
    async fn fetch(&self, backend: &Backend) -> Result<ClusterStats>;
}

/// Receiver of each cycle's fleet snapshot
pub trait ClusterStatsObserver: Send + Sync {
    fn observe(&self, stats: &[ClusterStats]);
}

/// Keeps the most recent fleet snapshot for readers
#[derive(Debug, Default)]
pub struct ClusterStatsBoard {
    latest: ArcSwap<Vec<ClusterStats>>,
}

impl ClusterStatsBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<Vec<ClusterStats>> {
        self.latest.load_full()
    }
}

impl ClusterStatsObserver for ClusterStatsBoard {
    fn observe(&self, stats: &[ClusterStats]) {
        self.latest.store(Arc::new(stats.to_vec()));
    }
}

/// Exports each snapshot as Prometheus gauges
#[derive(Debug, Default)]
pub struct MetricsObserver;

impl ClusterStatsObserver for MetricsObserver {
    fn observe(&self, stats: &[ClusterStats]) {
        let healthy = stats.iter().filter(|s| s.healthy).count() as i64;
        METRICS.monitor.healthy_backends.set(healthy);
        METRICS
            .monitor
            .unhealthy_backends
            .set(stats.len() as i64 - healthy);

        // Clusters that left the registry stop exporting
        METRICS.monitor.running_queries.reset();
        METRICS.monitor.queued_queries.reset();
        for cluster in stats {
            METRICS
                .monitor
                .running_queries
                .with_label_values(&[&cluster.cluster_id])
                .set(cluster.running_queries as i64);
            METRICS
                .monitor
                .queued_queries
                .with_label_values(&[&cluster.cluster_id])
                .set(cluster.queued_queries as i64);
        }
    }
}

/// Monitor loop tuning
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Pause between cycles
    pub interval: Duration,

    /// Upper bound on one backend's stats fetch
    pub probe_timeout: Duration,

    /// Maximum concurrent fetches
    pub worker_pool_size: usize,
}

impl MonitorOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            interval: config.monitor_delay(),
            probe_timeout: config.monitor_timeout(),
            worker_pool_size: config.monitor.worker_pool_size,
        }
    }
}

/// Telemetry transport selected by the monitor configuration
pub fn stats_source_from_config(config: &GatewayConfig) -> Result<Arc<dyn ClusterStatsSource>> {
    let monitor = &config.monitor;
    let timeout = config.monitor_timeout();
    if monitor.use_jwt_auth {
        let jwt = monitor
            .jwt
            .clone()
            .filter(|jwt| !jwt.is_empty())
            .ok_or_else(|| GatewayError::config("No valid JWT provided for health check"))?;
        Ok(Arc::new(SystemCatalogStatsSource::new(
            jwt,
            monitor.jdbc_port,
            monitor.jdbc_use_ssl,
            monitor.monitor_user.clone(),
            timeout,
        )?))
    } else {
        Ok(Arc::new(UiApiStatsSource::new(timeout)?))
    }
}

/// Periodic fleet poller
pub struct HealthMonitor {
    registry: Arc<dyn BackendRegistry>,
    source: Arc<dyn ClusterStatsSource>,
    observers: Vec<Arc<dyn ClusterStatsObserver>>,
    options: MonitorOptions,

    /// Bounds concurrent fetches within a cycle
    pool: Arc<Semaphore>,

    /// Shutdown flag
    shutdown: AtomicBool,

    /// Wakes the loop out of its sleep on shutdown
    notify: Notify,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<dyn BackendRegistry>,
        source: Arc<dyn ClusterStatsSource>,
        observers: Vec<Arc<dyn ClusterStatsObserver>>,
        options: MonitorOptions,
    ) -> Self {
        info!(
            "Running cluster monitor with connection timeout of {:?} and task delay of {:?}",
            options.probe_timeout, options.interval
        );
        Self {
            registry,
            source,
            observers,
            pool: Arc::new(Semaphore::new(options.worker_pool_size.max(1))),
            options,
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Start the background loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            while !monitor.shutdown.load(Ordering::Acquire) {
                if AssertUnwindSafe(monitor.run_cycle())
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!("Error performing backend monitor tasks");
                }

                tokio::select! {
                    _ = tokio::time::sleep(monitor.options.interval) => {}
                    _ = monitor.notify.notified() => {}
                }
            }
            info!("Cluster monitor stopped");
        })
    }

    /// Stop the loop after the current cycle or sleep
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Poll every active backend once and publish the snapshot.
    ///
    /// Waits for every fetch to finish or time out. The result keeps registry order.
    pub async fn run_cycle(&self) -> Vec<ClusterStats> {
        let started = Instant::now();
        let backends = self.registry.list_active();

        let handles: Vec<JoinHandle<ClusterStats>> = backends
            .iter()
            .cloned()
            .map(|backend| {
                let source = Arc::clone(&self.source);
                let pool = Arc::clone(&self.pool);
                let timeout = self.options.probe_timeout;
                tokio::spawn(async move {
                    let _permit = pool.acquire_owned().await;
                    fetch_with_timeout(source.as_ref(), &backend, timeout).await
                })
            })
            .collect();

        let mut stats = Vec::with_capacity(handles.len());
        for (backend, handle) in backends.iter().zip(handles) {
            match handle.await {
                Ok(cluster) => stats.push(cluster),
                Err(e) => {
                    error!("Stats task for {} failed: {}", backend.name, e);
                    stats.push(ClusterStats::unhealthy(backend));
                }
            }
        }

        for observer in &self.observers {
            observer.observe(&stats);
        }

        METRICS.monitor.cycles_total.inc();
        METRICS
            .monitor
            .cycle_duration
            .observe(started.elapsed().as_secs_f64());
        debug!(
            "Monitor cycle polled {} backends in {:?}",
            stats.len(),
            started.elapsed()
        );
        stats
    }
}

async fn fetch_with_timeout(
    source: &dyn ClusterStatsSource,
    backend: &Backend,
    timeout: Duration,
) -> ClusterStats {
    match tokio::time::timeout(timeout, source.fetch(backend)).await {
        Ok(Ok(stats)) => stats,
        Ok(Err(e)) => {
            warn!("Error fetching cluster stats from {}: {}", backend.name, e);
            ClusterStats::unhealthy(backend)
        }
        Err(_) => {
            warn!(
                "Fetching cluster stats from {} timed out after {:?}",
                backend.name, timeout
            );
            ClusterStats::unhealthy(backend)
        }
    }
}
