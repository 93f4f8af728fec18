//! Metrics collection for sqlgate
//!
//! This module provides Prometheus metrics for observability.
//! Counters are cheap atomics so they can be bumped on the request path.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;

/// Metrics registry for sqlgate
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub routing: RoutingMetrics,
    pub monitor: MonitorMetrics,
}

/// Request routing metrics
#[derive(Debug, Clone)]
pub struct RoutingMetrics {
    /// Requests routed, labelled by how the backend was chosen
    pub requests_routed: IntCounterVec,

    /// Query affinity lookups that had to run the miss-loader
    pub query_affinity_loads: IntCounter,

    /// Fleet-wide discovery probe rounds
    pub fleet_probe_rounds: IntCounter,

    /// Affinities recorded, labelled by namespace
    pub affinities_recorded: IntCounterVec,

    /// Requests rejected because no backend could be selected
    pub no_backends_available: IntCounter,

    /// Successful routing rule reloads
    pub rule_reloads: IntCounter,

    /// Failed routing rule reloads
    pub rule_reload_failures: IntCounter,
}

/// Health monitor metrics
#[derive(Debug, Clone)]
pub struct MonitorMetrics {
    /// Completed monitor cycles
    pub cycles_total: IntCounter,

    /// Duration of one monitor cycle
    pub cycle_duration: Histogram,

    /// Healthy backends in the last cycle
    pub healthy_backends: IntGauge,

    /// Unhealthy backends in the last cycle
    pub unhealthy_backends: IntGauge,

    /// Running queries per cluster
    pub running_queries: IntGaugeVec,

    /// Queued queries per cluster
    pub queued_queries: IntGaugeVec,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Routing metrics
        let requests_routed = IntCounterVec::new(
            Opts::new(
                "gateway_requests_routed_total",
                "Total number of requests routed to a backend",
            ),
            &["decision"],
        )
        .unwrap();

        let query_affinity_loads = IntCounter::new(
            "gateway_query_affinity_loads_total",
            "Query affinity cache misses that ran the loader",
        )
        .unwrap();

        let fleet_probe_rounds = IntCounter::new(
            "gateway_fleet_probe_rounds_total",
            "Fleet-wide query discovery probe rounds",
        )
        .unwrap();

        let affinities_recorded = IntCounterVec::new(
            Opts::new(
                "gateway_affinities_recorded_total",
                "Affinities recorded per namespace",
            ),
            &["namespace"],
        )
        .unwrap();

        let no_backends_available = IntCounter::new(
            "gateway_no_backends_available_total",
            "Total requests rejected due to no backends",
        )
        .unwrap();

        let rule_reloads = IntCounter::new(
            "gateway_rule_reloads_total",
            "Successful routing rule reloads",
        )
        .unwrap();

        let rule_reload_failures = IntCounter::new(
            "gateway_rule_reload_failures_total",
            "Failed routing rule reloads",
        )
        .unwrap();

        // Monitor metrics
        let cycles_total = IntCounter::new(
            "monitor_cycles_total",
            "Completed health monitor cycles",
        )
        .unwrap();

        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "monitor_cycle_duration_seconds",
                "Health monitor cycle duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .unwrap();

        let healthy_backends = IntGauge::new(
            "monitor_healthy_backends",
            "Backends reported healthy by the last cycle",
        )
        .unwrap();

        let unhealthy_backends = IntGauge::new(
            "monitor_unhealthy_backends",
            "Backends reported unhealthy by the last cycle",
        )
        .unwrap();

        let running_queries = IntGaugeVec::new(
            Opts::new("cluster_running_queries", "Running queries per cluster"),
            &["cluster"],
        )
        .unwrap();

        let queued_queries = IntGaugeVec::new(
            Opts::new("cluster_queued_queries", "Queued queries per cluster"),
            &["cluster"],
        )
        .unwrap();

        // Register all metrics
        registry.register(Box::new(requests_routed.clone())).unwrap();
        registry.register(Box::new(query_affinity_loads.clone())).unwrap();
        registry.register(Box::new(fleet_probe_rounds.clone())).unwrap();
        registry.register(Box::new(affinities_recorded.clone())).unwrap();
        registry.register(Box::new(no_backends_available.clone())).unwrap();
        registry.register(Box::new(rule_reloads.clone())).unwrap();
        registry.register(Box::new(rule_reload_failures.clone())).unwrap();

        registry.register(Box::new(cycles_total.clone())).unwrap();
        registry.register(Box::new(cycle_duration.clone())).unwrap();
        registry.register(Box::new(healthy_backends.clone())).unwrap();
        registry.register(Box::new(unhealthy_backends.clone())).unwrap();
        registry.register(Box::new(running_queries.clone())).unwrap();
        registry.register(Box::new(queued_queries.clone())).unwrap();

        let routing = RoutingMetrics {
            requests_routed,
            query_affinity_loads,
            fleet_probe_rounds,
            affinities_recorded,
            no_backends_available,
            rule_reloads,
            rule_reload_failures,
        };

        let monitor = MonitorMetrics {
            cycles_total,
            cycle_duration,
            healthy_backends,
            unhealthy_backends,
            running_queries,
            queued_queries,
        };

        MetricsRegistry {
            registry,
            routing,
            monitor,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
