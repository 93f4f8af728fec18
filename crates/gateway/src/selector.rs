//! Routing group selection
//!
//! A request is mapped to a routing group either straight from a header or by
//! evaluating the hot-reloaded rule set. The strategy is fixed at construction.

use crate::extract;
use crate::rules::RuleReloadingSelector;
use http::HeaderMap;
use sqlgate_common::config::RoutingRulesConfig;
use tracing::info;

/// Request facts visible to routing rules
#[derive(Debug, Clone)]
pub struct RequestFacts<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub user: Option<String>,
    pub source: Option<String>,
}

impl<'a> RequestFacts<'a> {
    pub fn new(method: &'a str, path: &'a str, headers: &'a HeaderMap) -> Self {
        Self {
            method,
            path,
            headers,
            user: extract::user(headers),
            source: extract::source(headers),
        }
    }

    /// First value of header `name`
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Strategy used to find a request's routing group
pub enum RoutingGroupSelector {
    /// Read the routing group header (or its legacy alternate)
    Header,

    /// Evaluate the rules file, reloading it when it changes
    Rules(RuleReloadingSelector),
}

impl RoutingGroupSelector {
    pub fn from_config(config: &RoutingRulesConfig) -> Self {
        match (config.enabled, &config.rules_config_path) {
            (true, Some(path)) => {
                info!("Routing groups selected by rules in {}", path.display());
                RoutingGroupSelector::Rules(RuleReloadingSelector::new(path.clone()))
            }
            _ => {
                info!("Routing groups selected by request header");
                RoutingGroupSelector::Header
            }
        }
    }

    /// Routing group for the request, or `None` when it has none
    pub fn find_routing_group(&self, facts: &RequestFacts<'_>) -> Option<String> {
        match self {
            RoutingGroupSelector::Header => extract::routing_group_header(facts.headers),
            RoutingGroupSelector::Rules(rules) => rules.find_routing_group(facts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_header_selector() {
        let mut headers = HeaderMap::new();
        headers.insert(
            extract::ROUTING_GROUP_HEADER,
            HeaderValue::from_static("etl"),
        );
        headers.insert(
            extract::ALTERNATE_ROUTING_GROUP_HEADER,
            HeaderValue::from_static("legacy"),
        );
        let facts = RequestFacts::new("POST", "/v1/statement", &headers);

        let selector = RoutingGroupSelector::from_config(&RoutingRulesConfig::default());
        assert_eq!(selector.find_routing_group(&facts).as_deref(), Some("etl"));

        let empty = HeaderMap::new();
        let facts = RequestFacts::new("POST", "/v1/statement", &empty);
        assert!(selector.find_routing_group(&facts).is_none());
    }
}
