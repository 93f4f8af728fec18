//! sqlgate gateway
//!
//! Routing core of an HA gateway in front of several SQL query-engine clusters:
//! backend selection, query and UI session affinity, rule based routing groups
//! and background cluster health monitoring.

pub mod admin;
pub mod backend;
pub mod extract;
pub mod handler;
pub mod history;
pub mod monitor;
pub mod routing;
pub mod rules;
pub mod selector;
pub mod store;

pub use backend::{Backend, BackendRegistry, StaticBackendRegistry};
pub use handler::{InboundRequest, RequestRouter, RouteDecision, RouteTarget};
pub use history::{BoundedQueryHistory, QueryDetail, QueryHistory};
pub use monitor::{
    ClusterStats, ClusterStatsBoard, ClusterStatsObserver, ClusterStatsSource, HealthMonitor,
    MetricsObserver, MonitorOptions,
};
pub use routing::{AffinityMode, HttpQueryProbe, QueryProbe, RoutingEngine, RoutingOptions};
pub use selector::{RequestFacts, RoutingGroupSelector};
pub use store::{AffinityRecord, AffinityStore, InMemoryAffinityStore, Namespace};
