//! Stats queried from the engine's system catalog over its HTTP statement protocol,
//! authenticated with a bearer token.

use super::{ClusterStats, ClusterStatsSource};
use crate::backend::Backend;
use crate::extract::{USER_HEADER, V1_STATEMENT_PATH};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlgate_common::error::{GatewayError, Result};
use std::time::Duration;
use tracing::debug;

const QUERY_STATS_SQL: &str = "select \
    count_if(upper(state) = 'RUNNING') as running_queries, \
    count_if(upper(state) = 'QUEUED') as queued_queries, \
    count_if(upper(state) = 'BLOCKED') as blocked_queries \
    from system.runtime.queries";

const NODE_STATS_SQL: &str = "select \
    count_if(not coordinator and upper(state) = 'ACTIVE') as active_workers \
    from system.runtime.nodes";

const CATALOG_HEADER: &str = "X-Trino-Catalog";
const SCHEMA_HEADER: &str = "X-Trino-Schema";

/// Upper bound on result pages followed for one statement
const MAX_PAGES: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementPage {
    next_uri: Option<String>,
    #[serde(default)]
    data: Vec<Vec<Value>>,
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct StatementError {
    message: String,
}

/// Runs count queries against `system.runtime` on each backend's coordinator
#[derive(Debug, Clone)]
pub struct SystemCatalogStatsSource {
    client: reqwest::Client,
    jwt: String,
    port: u16,
    use_ssl: bool,
    user: String,
}

impl SystemCatalogStatsSource {
    pub fn new(
        jwt: String,
        port: u16,
        use_ssl: bool,
        user: String,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            jwt,
            port,
            use_ssl,
            user,
        })
    }

    /// Statement endpoint on the backend's host at the configured port
    fn statement_url(&self, backend: &Backend) -> Result<String> {
        let uri = backend
            .proxy_to
            .parse::<http::Uri>()
            .map_err(|e| GatewayError::parse(format!("Cannot construct URL from {}: {}", backend.proxy_to, e)))?;
        let host = uri
            .host()
            .ok_or_else(|| GatewayError::parse(format!("No host in {}", backend.proxy_to)))?;
        let scheme = if self.use_ssl { "https" } else { "http" };
        Ok(format!("{}://{}:{}{}", scheme, host, self.port, V1_STATEMENT_PATH))
    }

    /// Run `sql` to completion and return its rows
    async fn execute(&self, statement_url: &str, sql: &str) -> Result<Vec<Vec<Value>>> {
        let request = self
            .client
            .post(statement_url)
            .bearer_auth(&self.jwt)
            .header(USER_HEADER, &self.user)
            .header(CATALOG_HEADER, "system")
            .header(SCHEMA_HEADER, "runtime")
            .body(sql.to_string());
        let mut page = self.read_page(request, statement_url).await?;

        let mut rows = Vec::new();
        for _ in 0..MAX_PAGES {
            if let Some(error) = page.error {
                return Err(GatewayError::UnexpectedStatus {
                    status: 200,
                    target: format!("{}: {}", statement_url, error.message),
                });
            }
            rows.extend(page.data);
            let next_uri = match page.next_uri {
                Some(next_uri) => next_uri,
                None => return Ok(rows),
            };
            debug!("Following {}", next_uri);
            let request = self
                .client
                .get(&next_uri)
                .bearer_auth(&self.jwt)
                .header(USER_HEADER, &self.user);
            page = self.read_page(request, &next_uri).await?;
        }
        Err(GatewayError::timeout(format!(
            "statement on {} did not finish within {} pages",
            statement_url, MAX_PAGES
        )))
    }

    async fn read_page(&self, request: reqwest::RequestBuilder, target: &str) -> Result<StatementPage> {
        let response = request.send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(GatewayError::UnexpectedStatus {
                status: response.status().as_u16(),
                target: target.to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

fn count_at(rows: &[Vec<Value>], column: usize) -> Result<u64> {
    rows.first()
        .and_then(|row| row.get(column))
        .and_then(Value::as_u64)
        .ok_or_else(|| GatewayError::parse(format!("missing count in column {}", column)))
}

#[async_trait]
impl ClusterStatsSource for SystemCatalogStatsSource {
    async fn fetch(&self, backend: &Backend) -> Result<ClusterStats> {
        let statement_url = self.statement_url(backend)?;

        let query_rows = self.execute(&statement_url, QUERY_STATS_SQL).await?;
        let node_rows = self.execute(&statement_url, NODE_STATS_SQL).await?;

        Ok(ClusterStats {
            running_queries: count_at(&query_rows, 0)?,
            queued_queries: count_at(&query_rows, 1)?,
            blocked_queries: count_at(&query_rows, 2)?,
            active_workers: count_at(&node_rows, 0)?,
            healthy: true,
            ..ClusterStats::unhealthy(backend)
        })
    }
}
