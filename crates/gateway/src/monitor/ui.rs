//! Stats scraped from the engine's web UI JSON endpoints

use super::{ClusterStats, ClusterStatsSource};
use crate::backend::Backend;
use crate::extract::{UI_API_QUEUED_LIST_PATH, UI_API_STATS_PATH};
use async_trait::async_trait;
use serde::Deserialize;
use sqlgate_common::error::{GatewayError, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UiStats {
    #[serde(default)]
    active_workers: u64,
    #[serde(default)]
    queued_queries: u64,
    #[serde(default)]
    running_queries: u64,
    #[serde(default)]
    blocked_queries: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedQuery {
    session_user: Option<String>,
}

/// Reads `/ui/api/stats` and the queued query list of each backend
#[derive(Debug, Clone)]
pub struct UiApiStatsSource {
    client: reqwest::Client,
}

impl UiApiStatsSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    async fn get_text(&self, target: &str) -> Result<String> {
        let response = self.client.get(target).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(GatewayError::UnexpectedStatus {
                status: response.status().as_u16(),
                target: target.to_string(),
            });
        }
        Ok(response.text().await?)
    }

    /// Queued query count per session user
    async fn user_queued_count(&self, backend: &Backend) -> Result<BTreeMap<String, u64>> {
        let target = format!("{}{}", backend.proxy_to, UI_API_QUEUED_LIST_PATH);
        let queries: Vec<QueuedQuery> = serde_json::from_str(&self.get_text(&target).await?)?;

        let mut counts = BTreeMap::new();
        for user in queries.into_iter().filter_map(|q| q.session_user) {
            *counts.entry(user).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl ClusterStatsSource for UiApiStatsSource {
    async fn fetch(&self, backend: &Backend) -> Result<ClusterStats> {
        let target = format!("{}{}", backend.proxy_to, UI_API_STATS_PATH);
        let text = self.get_text(&target).await?;
        if text.trim().is_empty() {
            return Err(GatewayError::parse(format!("empty response from {}", target)));
        }
        let stats: UiStats = serde_json::from_str(&text)?;

        // Cluster level figures decide health; per-user counts are best effort
        let user_queued_count = match self.user_queued_count(backend).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("Error fetching cluster user stats from {}: {}", backend.name, e);
                BTreeMap::new()
            }
        };

        Ok(ClusterStats {
            running_queries: stats.running_queries,
            queued_queries: stats.queued_queries,
            blocked_queries: stats.blocked_queries,
            active_workers: stats.active_workers,
            user_queued_count,
            healthy: true,
            ..ClusterStats::unhealthy(backend)
        })
    }
}
