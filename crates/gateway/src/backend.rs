//! Backend clusters and the registry the core reads them from.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use sqlgate_common::config::BackendConfig;
use sqlgate_common::ADHOC_ROUTING_GROUP;
use std::sync::Arc;
use tracing::info;

/// One query-engine cluster behind the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    /// Cluster name
    pub name: String,

    /// URL requests are forwarded to
    pub proxy_to: String,

    /// URL shown to users
    pub external_url: String,

    /// Routing group this cluster serves
    pub routing_group: String,

    /// Whether the cluster receives traffic
    pub active: bool,
}

impl Backend {
    /// Create an active backend
    pub fn new(
        name: impl Into<String>,
        proxy_to: impl Into<String>,
        routing_group: impl Into<String>,
    ) -> Self {
        let proxy_to = proxy_to.into();
        Self {
            name: name.into(),
            external_url: proxy_to.clone(),
            proxy_to,
            routing_group: routing_group.into(),
            active: true,
        }
    }

    /// Whether the backend belongs to the default pool
    pub fn is_adhoc(&self) -> bool {
        self.routing_group == ADHOC_ROUTING_GROUP
    }
}

impl From<&BackendConfig> for Backend {
    fn from(config: &BackendConfig) -> Self {
        let proxy_to = config.proxy_to.trim_end_matches('/').to_string();
        Self {
            name: config.name.clone(),
            external_url: config
                .external_url
                .clone()
                .unwrap_or_else(|| proxy_to.clone()),
            proxy_to,
            routing_group: config.routing_group.clone(),
            active: config.active,
        }
    }
}

/// Source of truth for the backend fleet. The core only reads from it.
pub trait BackendRegistry: Send + Sync {
    /// Every active backend
    fn list_active(&self) -> Vec<Backend>;

    /// Active backends tagged with `routing_group`
    fn list_active_in_group(&self, routing_group: &str) -> Vec<Backend>;

    /// Every backend, active or not
    fn list_all(&self) -> Vec<Backend>;

    /// Active backends of the default pool, in registry order
    fn list_active_adhoc(&self) -> Vec<Backend> {
        self.list_active_in_group(ADHOC_ROUTING_GROUP)
    }
}

/// Registry backed by a fixed list that can be swapped atomically.
///
/// Readers take a snapshot without locking, so a refresh never blocks the request path.
#[derive(Debug)]
pub struct StaticBackendRegistry {
    backends: ArcSwap<Vec<Backend>>,
}

impl StaticBackendRegistry {
    /// Create a registry with the initial set of backends
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends: ArcSwap::from_pointee(backends),
        }
    }

    /// Build a registry from configuration
    pub fn from_config(configs: &[BackendConfig]) -> Self {
        Self::new(configs.iter().map(Backend::from).collect())
    }

    /// Atomically replace the entire set of backends
    pub fn replace(&self, backends: Vec<Backend>) {
        info!("Backend registry refreshed with {} backends", backends.len());
        self.backends.store(Arc::new(backends));
    }

    /// Activate or deactivate a backend by name. Returns false if it is unknown.
    pub fn set_active(&self, name: &str, active: bool) -> bool {
        // Read-copy-update: a concurrent change to another backend is retried, not overwritten
        let previous = self.backends.rcu(|current| {
            Arc::new(
                current
                    .iter()
                    .cloned()
                    .map(|mut b| {
                        if b.name == name {
                            b.active = active;
                        }
                        b
                    })
                    .collect::<Vec<_>>(),
            )
        });
        if !previous.iter().any(|b| b.name == name) {
            return false;
        }
        info!("Backend {} marked active={}", name, active);
        true
    }
}

impl BackendRegistry for StaticBackendRegistry {
    fn list_active(&self) -> Vec<Backend> {
        self.backends
            .load()
            .iter()
            .filter(|b| b.active)
            .cloned()
            .collect()
    }

    fn list_active_in_group(&self, routing_group: &str) -> Vec<Backend> {
        self.backends
            .load()
            .iter()
            .filter(|b| b.active && b.routing_group == routing_group)
            .cloned()
            .collect()
    }

    fn list_all(&self) -> Vec<Backend> {
        self.backends.load().as_ref().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StaticBackendRegistry {
        let mut disabled = Backend::new("adhoc-2", "http://adhoc-2:8080", ADHOC_ROUTING_GROUP);
        disabled.active = false;
        StaticBackendRegistry::new(vec![
            Backend::new("adhoc-1", "http://adhoc-1:8080", ADHOC_ROUTING_GROUP),
            disabled,
            Backend::new("etl-1", "http://etl-1:8080", "etl"),
        ])
    }

    #[test]
    fn test_registry_filters() {
        let registry = registry();

        assert_eq!(registry.list_all().len(), 3);
        assert_eq!(registry.list_active().len(), 2);

        let adhoc = registry.list_active_adhoc();
        assert_eq!(adhoc.len(), 1);
        assert_eq!(adhoc[0].name, "adhoc-1");

        let etl = registry.list_active_in_group("etl");
        assert_eq!(etl[0].proxy_to, "http://etl-1:8080");
        assert!(registry.list_active_in_group("missing").is_empty());
    }

    #[test]
    fn test_set_active() {
        let registry = registry();

        assert!(registry.set_active("adhoc-2", true));
        assert_eq!(registry.list_active_adhoc().len(), 2);
        assert!(!registry.set_active("nope", true));
    }

    #[test]
    fn test_concurrent_set_active_keeps_every_change() {
        let backends = (0..16)
            .map(|i| {
                let mut backend =
                    Backend::new(format!("b{}", i), format!("http://b{}:8080", i), ADHOC_ROUTING_GROUP);
                backend.active = false;
                backend
            })
            .collect();
        let registry = StaticBackendRegistry::new(backends);

        std::thread::scope(|scope| {
            for i in 0..16 {
                let registry = &registry;
                scope.spawn(move || {
                    for _ in 0..50 {
                        assert!(registry.set_active(&format!("b{}", i), true));
                    }
                });
            }
        });

        assert_eq!(registry.list_active().len(), 16);
    }

    #[test]
    fn test_replace_swaps_whole_fleet() {
        let registry = registry();
        registry.replace(vec![Backend::new("etl-2", "http://etl-2:8080", "etl")]);

        assert_eq!(registry.list_all().len(), 1);
        assert!(registry.list_active_adhoc().is_empty());
        assert_eq!(registry.list_active_in_group("etl")[0].name, "etl-2");
    }

    #[test]
    fn test_from_config_trims_trailing_slash() {
        let config = BackendConfig {
            name: "b".to_string(),
            proxy_to: "http://b:8080/".to_string(),
            external_url: None,
            routing_group: "etl".to_string(),
            active: true,
        };
        let backend = Backend::from(&config);
        assert_eq!(backend.proxy_to, "http://b:8080");
        assert_eq!(backend.external_url, "http://b:8080");
        assert!(!backend.is_adhoc());
    }
}
