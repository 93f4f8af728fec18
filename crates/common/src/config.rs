//! Configuration structures for sqlgate
//!
//! Configuration is loaded from a YAML file and can be overridden by environment
//! variables of the form `SQLGATE__<SECTION>__<KEY>` (e.g. `SQLGATE__MONITOR__JWT`).

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Routing group used for backends that are not restricted to a named pool
pub const ADHOC_ROUTING_GROUP: &str = "adhoc";

/// Top-level configuration for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the admin endpoint binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Number of query history entries kept in memory
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Backend clusters behind the gateway
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Affinity caching and discovery
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Rule based routing group selection
    #[serde(default)]
    pub routing_rules: RoutingRulesConfig,

    /// Backend health monitoring
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// One backend cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique cluster name
    pub name: String,

    /// URL the gateway forwards to
    pub proxy_to: String,

    /// URL users see in dashboards (defaults to `proxy_to`)
    #[serde(default)]
    pub external_url: Option<String>,

    /// Routing group the backend belongs to
    #[serde(default = "default_routing_group")]
    pub routing_group: String,

    /// Whether the backend receives traffic
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Affinity cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Discover unknown query ids by probing the fleet and keep recorded
    /// affinities in memory only. When false, affinities are written through
    /// to the affinity store.
    #[serde(default = "default_true")]
    pub lookup_query_ids: bool,

    /// Maximum entries per affinity cache
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: u64,

    /// Idle time after which a cached affinity expires
    #[serde(default = "default_cache_idle_secs")]
    pub cache_idle_secs: u64,

    /// Timeout for each fleet probe request
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Lifetime of an unmatched submission correlation entry
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
}

/// Rule engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRulesConfig {
    /// Use the rules file instead of the routing group header
    #[serde(default)]
    pub enabled: bool,

    /// Path of the YAML rules file
    #[serde(default)]
    pub rules_config_path: Option<PathBuf>,
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Delay between two monitor cycles
    #[serde(default = "default_task_delay_secs")]
    pub task_delay_secs: u64,

    /// Connect/read timeout for each backend stats request
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Maximum number of backends probed concurrently
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Query the system catalog with a bearer token instead of scraping the UI API
    #[serde(default)]
    pub use_jwt_auth: bool,

    /// Bearer token used when `use_jwt_auth` is set
    #[serde(default)]
    pub jwt: Option<String>,

    /// Port of the statement API used by the catalog transport
    #[serde(default = "default_jdbc_port")]
    pub jdbc_port: u16,

    /// Use https for the catalog transport
    #[serde(default)]
    pub jdbc_use_ssl: bool,

    /// User reported to backends by monitor queries
    #[serde(default = "default_monitor_user")]
    pub monitor_user: String,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable the admin endpoint with Prometheus metrics
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Admin endpoint port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            history_size: default_history_size(),
            backends: Vec::new(),
            routing: RoutingConfig::default(),
            routing_rules: RoutingRulesConfig::default(),
            monitor: MonitorConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            lookup_query_ids: true,
            cache_max_entries: default_cache_max_entries(),
            cache_idle_secs: default_cache_idle_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            pending_ttl_secs: default_pending_ttl_secs(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            task_delay_secs: default_task_delay_secs(),
            connection_timeout_secs: default_connection_timeout_secs(),
            worker_pool_size: default_worker_pool_size(),
            use_jwt_auth: false,
            jwt: None,
            jdbc_port: default_jdbc_port(),
            jdbc_use_ssl: false,
            monitor_user: default_monitor_user(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: true,
            metrics_port: default_metrics_port(),
        }
    }
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_history_size() -> usize {
    2000
}

fn default_routing_group() -> String {
    ADHOC_ROUTING_GROUP.to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_max_entries() -> u64 {
    10_000
}

fn default_cache_idle_secs() -> u64 {
    30 * 60
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_pending_ttl_secs() -> u64 {
    300
}

fn default_task_delay_secs() -> u64 {
    60
}

fn default_connection_timeout_secs() -> u64 {
    15
}

fn default_worker_pool_size() -> usize {
    20
}

fn default_jdbc_port() -> u16 {
    8080
}

fn default_monitor_user() -> String {
    "sqlgate".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9091
}

impl GatewayConfig {
    /// Load configuration from a YAML file, applying `SQLGATE__` environment overrides
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_path()).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix("SQLGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                GatewayError::Config(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let config: GatewayConfig = settings.try_deserialize().map_err(|e| {
            GatewayError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string without environment overrides
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bind_address.trim().is_empty() {
            return Err(GatewayError::config("bind_address must not be empty"));
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "Duplicate backend name: {}",
                    backend.name
                )));
            }
            if !is_http_url(&backend.proxy_to) {
                return Err(GatewayError::config(format!(
                    "Backend {} has invalid proxy_to URL: {}",
                    backend.name, backend.proxy_to
                )));
            }
        }

        if self.routing.cache_max_entries == 0
            || self.routing.cache_idle_secs == 0
            || self.routing.probe_timeout_secs == 0
            || self.routing.pending_ttl_secs == 0
        {
            return Err(GatewayError::config(
                "routing cache sizes and timeouts must be greater than zero",
            ));
        }

        if self.routing_rules.enabled && self.routing_rules.rules_config_path.is_none() {
            return Err(GatewayError::config(
                "routing_rules.rules_config_path is required when rules are enabled",
            ));
        }

        if self.monitor.task_delay_secs == 0
            || self.monitor.connection_timeout_secs == 0
            || self.monitor.worker_pool_size == 0
        {
            return Err(GatewayError::config(
                "monitor delay, timeout and pool size must be greater than zero",
            ));
        }

        if self.monitor.use_jwt_auth
            && self.monitor.jwt.as_deref().map_or(true, |jwt| jwt.trim().is_empty())
        {
            return Err(GatewayError::config(
                "No valid JWT provided for health check",
            ));
        }

        Ok(())
    }

    /// Get the affinity cache idle window as Duration
    pub fn cache_idle(&self) -> Duration {
        Duration::from_secs(self.routing.cache_idle_secs)
    }

    /// Get the fleet probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.routing.probe_timeout_secs)
    }

    /// Get the correlation entry lifetime as Duration
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.routing.pending_ttl_secs)
    }

    /// Get the delay between monitor cycles as Duration
    pub fn monitor_delay(&self) -> Duration {
        Duration::from_secs(self.monitor.task_delay_secs)
    }

    /// Get the monitor connection timeout as Duration
    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.connection_timeout_secs)
    }
}

fn is_http_url(value: &str) -> bool {
    match value.parse::<http::Uri>() {
        Ok(uri) => {
            matches!(uri.scheme_str(), Some("http") | Some("https")) && uri.host().is_some()
        }
        Err(_) => false,
    }
}
