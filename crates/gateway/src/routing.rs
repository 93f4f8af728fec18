//! Backend selection and identity affinity
//!
//! The routing engine picks backends for new work and remembers which backend owns
//! a query id or UI session. Two bounded caches with sliding expiration sit in front
//! of the affinity store; their loaders are coalesced per key, so concurrent misses
//! for the same identity share one load.

use crate::backend::{Backend, BackendRegistry};
use crate::store::{AffinityStore, Namespace};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use moka::future::Cache;
use rand::seq::SliceRandom;
use sqlgate_common::error::{GatewayError, Result};
use sqlgate_common::{GatewayConfig, METRICS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Existence check for a query on one backend
#[async_trait]
pub trait QueryProbe: Send + Sync {
    /// Whether `backend` knows about `query_id`
    async fn owns_query(&self, backend: &Backend, query_id: &str) -> Result<bool>;
}

/// Probe that issues `HEAD <backend>/v1/query/<id>` and expects a 200
#[derive(Debug, Clone)]
pub struct HttpQueryProbe {
    client: reqwest::Client,
}

impl HttpQueryProbe {
    /// Create a probe whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl QueryProbe for HttpQueryProbe {
    async fn owns_query(&self, backend: &Backend, query_id: &str) -> Result<bool> {
        let target = format!("{}/v1/query/{}", backend.proxy_to, query_id);
        let response = self.client.head(&target).send().await?;
        Ok(response.status() == reqwest::StatusCode::OK)
    }
}

/// Where recorded query affinities live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityMode {
    /// Recorded affinities stay in the process-local cache; unknown ids are
    /// discovered by probing the fleet. A restart loses the history.
    Caching,

    /// Recorded affinities are written through to the affinity store.
    Durable,
}

impl AffinityMode {
    /// Mode selected by the `lookup_query_ids` flag
    pub fn from_lookup_flag(lookup_query_ids: bool) -> Self {
        if lookup_query_ids {
            AffinityMode::Caching
        } else {
            AffinityMode::Durable
        }
    }
}

/// Routing engine tuning
#[derive(Debug, Clone)]
pub struct RoutingOptions {
    pub mode: AffinityMode,
    pub cache_max_entries: u64,
    pub cache_idle: Duration,
    pub probe_timeout: Duration,
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self {
            mode: AffinityMode::Caching,
            cache_max_entries: 10_000,
            cache_idle: Duration::from_secs(30 * 60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl RoutingOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            mode: AffinityMode::from_lookup_flag(config.routing.lookup_query_ids),
            cache_max_entries: config.routing.cache_max_entries,
            cache_idle: config.cache_idle(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

/// Central routing decision component
pub struct RoutingEngine {
    /// Fleet source of truth
    registry: Arc<dyn BackendRegistry>,

    /// Durable affinity backstop
    store: Arc<dyn AffinityStore>,

    /// Query existence probe used for discovery
    probe: Arc<dyn QueryProbe>,

    mode: AffinityMode,
    probe_timeout: Duration,

    /// Query id -> backend
    query_cache: Cache<String, String>,

    /// UI session token -> backend
    ui_cache: Cache<String, String>,
}

impl RoutingEngine {
    /// Create a new routing engine
    pub fn new(
        registry: Arc<dyn BackendRegistry>,
        store: Arc<dyn AffinityStore>,
        probe: Arc<dyn QueryProbe>,
        options: RoutingOptions,
    ) -> Self {
        let query_cache = Cache::builder()
            .max_capacity(options.cache_max_entries)
            .time_to_idle(options.cache_idle)
            .build();
        let ui_cache = Cache::builder()
            .max_capacity(options.cache_max_entries)
            .time_to_idle(options.cache_idle)
            .build();

        info!(
            "Routing engine started: mode={:?}, cache_max_entries={}, cache_idle={:?}",
            options.mode, options.cache_max_entries, options.cache_idle
        );

        Self {
            registry,
            store,
            probe,
            mode: options.mode,
            probe_timeout: options.probe_timeout,
            query_cache,
            ui_cache,
        }
    }

    pub fn mode(&self) -> AffinityMode {
        self.mode
    }

    /// Pick a random active backend from the default pool
    pub fn select_adhoc_backend(&self, user: Option<&str>) -> Result<String> {
        let backends = self.registry.list_active_adhoc();
        match backends.choose(&mut rand::thread_rng()) {
            Some(backend) => {
                debug!("Selected adhoc backend {} for user {:?}", backend.name, user);
                Ok(backend.proxy_to.clone())
            }
            None => {
                METRICS.routing.no_backends_available.inc();
                Err(GatewayError::no_backends(
                    "Number of active adhoc backends found zero",
                ))
            }
        }
    }

    /// Pick a random active backend of `routing_group`, falling back to the
    /// default pool when the group has none.
    pub fn select_backend_for_group(&self, routing_group: &str, user: Option<&str>) -> Result<String> {
        let backends = self.registry.list_active_in_group(routing_group);
        match backends.choose(&mut rand::thread_rng()) {
            Some(backend) => {
                debug!(
                    "Selected backend {} of group {} for user {:?}",
                    backend.name, routing_group, user
                );
                Ok(backend.proxy_to.clone())
            }
            None => {
                debug!(
                    "No active backend in group {}, falling back to adhoc",
                    routing_group
                );
                self.select_adhoc_backend(user)
            }
        }
    }

    /// Backend that owns `query_id`, loading it on a cache miss.
    ///
    /// Returns `None` only when the id is unknown everywhere and the default pool is empty.
    pub async fn resolve_query_affinity(&self, query_id: &str) -> Option<String> {
        self.query_cache
            .optionally_get_with(query_id.to_string(), self.load_query_backend(query_id))
            .await
    }

    /// Backend bound to a UI session, loading it on a cache miss.
    ///
    /// Unknown sessions get a fresh adhoc backend; this only fails when the
    /// default pool is empty.
    pub async fn resolve_ui_affinity(&self, session_token: &str) -> Result<String> {
        self.ui_cache
            .try_get_with(session_token.to_string(), self.load_ui_backend(session_token))
            .await
            .map_err(|err| match err.as_ref() {
                GatewayError::NoBackendsAvailable(msg) => GatewayError::no_backends(msg.clone()),
                other => GatewayError::internal(other.to_string()),
            })
    }

    /// Remember that `query_id` lives on `backend_url`
    pub async fn record_query_affinity(&self, query_id: &str, backend_url: &str) {
        match self.mode {
            AffinityMode::Caching => {
                self.query_cache
                    .insert(query_id.to_string(), backend_url.to_string())
                    .await;
            }
            AffinityMode::Durable => {
                self.persist(Namespace::Query, query_id, backend_url).await;
                // Next lookup must read the store instead of a stale cached value
                self.query_cache.invalidate(query_id).await;
            }
        }
        METRICS
            .routing
            .affinities_recorded
            .with_label_values(&[Namespace::Query.as_str()])
            .inc();
        debug!("QueryId [{}] mapped with backend [{}]", query_id, backend_url);
    }

    /// Remember that a UI session lives on `backend_url`
    pub async fn record_ui_affinity(&self, session_token: &str, backend_url: &str) {
        self.persist(Namespace::Ui, session_token, backend_url).await;
        self.ui_cache.invalidate(session_token).await;
        METRICS
            .routing
            .affinities_recorded
            .with_label_values(&[Namespace::Ui.as_str()])
            .inc();
    }

    /// Drop the query affinity. Returns whether a durable record existed.
    pub async fn forget_query_affinity(&self, query_id: &str) -> bool {
        self.query_cache.invalidate(query_id).await;
        self.remove(Namespace::Query, query_id).await
    }

    /// Drop the UI affinity. Returns whether a durable record existed.
    pub async fn forget_ui_affinity(&self, session_token: &str) -> bool {
        self.ui_cache.invalidate(session_token).await;
        self.remove(Namespace::Ui, session_token).await
    }

    /// Miss-loader for query ids: store, then fleet discovery, then the first adhoc backend
    async fn load_query_backend(&self, query_id: &str) -> Option<String> {
        METRICS.routing.query_affinity_loads.inc();

        if let Some(backend) = self.lookup(Namespace::Query, query_id).await {
            return Some(backend);
        }

        debug!(
            "Unable to find backend mapping for [{}]. Searching for suitable backend",
            query_id
        );
        if let Some(owner) = self.discover_query_owner(query_id).await {
            if self.mode == AffinityMode::Durable {
                self.persist(Namespace::Query, query_id, &owner).await;
            }
            return Some(owner);
        }

        // Deterministic for a fixed registry snapshot
        let fallback = self
            .registry
            .list_active_adhoc()
            .first()
            .map(|backend| backend.proxy_to.clone());
        warn!(
            "Query id [{}] not found on any backend, falling back to {:?}",
            query_id, fallback
        );
        fallback
    }

    /// Probe every backend concurrently; the first affirmative answer wins
    async fn discover_query_owner(&self, query_id: &str) -> Option<String> {
        let backends = self.registry.list_all();
        if backends.is_empty() {
            return None;
        }
        METRICS.routing.fleet_probe_rounds.inc();

        let probe = &self.probe;
        let probe_timeout = self.probe_timeout;
        let mut probes: FuturesUnordered<_> = backends
            .into_iter()
            .map(|backend| async move {
                let outcome =
                    tokio::time::timeout(probe_timeout, probe.owns_query(&backend, query_id)).await;
                (backend, outcome)
            })
            .collect();

        while let Some((backend, outcome)) = probes.next().await {
            match outcome {
                Ok(Ok(true)) => {
                    info!("Found query [{}] on backend [{}]", query_id, backend.proxy_to);
                    return Some(backend.proxy_to);
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    debug!("Probe of {} for query {} failed: {}", backend.name, query_id, e);
                }
                Err(_) => {
                    debug!(
                        "Probe of {} for query {} timed out after {:?}",
                        backend.name, query_id, probe_timeout
                    );
                }
            }
        }
        None
    }

    /// Miss-loader for UI sessions: store, then a fresh adhoc backend
    async fn load_ui_backend(&self, session_token: &str) -> Result<String> {
        if let Some(backend) = self.lookup(Namespace::Ui, session_token).await {
            return Ok(backend);
        }
        warn!("No backend found for UI cookie {}", session_token);
        self.select_adhoc_backend(None)
    }

    async fn lookup(&self, namespace: Namespace, key: &str) -> Option<String> {
        match self.store.get(namespace, key).await {
            Ok(Some(backend)) if !backend.is_empty() => Some(backend),
            Ok(_) => None,
            Err(e) => {
                warn!("Error reading {} affinity for {}: {}", namespace, key, e);
                None
            }
        }
    }

    async fn persist(&self, namespace: Namespace, key: &str, backend_url: &str) {
        if let Err(e) = self.store.put(namespace, key, backend_url).await {
            warn!(
                "Error saving {} affinity {} for backend {}: {}",
                namespace, key, backend_url, e
            );
        }
    }

    async fn remove(&self, namespace: Namespace, key: &str) -> bool {
        match self.store.delete(namespace, key).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!("Error deleting {} affinity {}: {}", namespace, key, e);
                false
            }
        }
    }
}
