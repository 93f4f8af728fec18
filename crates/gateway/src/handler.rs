//! Request-facing routing hooks
//!
//! The forwarding layer calls [`RequestRouter::on_before_forward`] to pick a backend
//! and [`RequestRouter::on_after_response`] once the backend answered, so new query
//! ids and UI sessions can be bound to the backend that created them.

use crate::extract;
use crate::history::{QueryDetail, QueryHistory};
use crate::routing::RoutingEngine;
use crate::selector::{RequestFacts, RoutingGroupSelector};
use bytes::Bytes;
use flate2::read::GzDecoder;
use http::header::CONTENT_ENCODING;
use http::{HeaderMap, Method, StatusCode};
use moka::future::Cache;
use serde::Deserialize;
use sqlgate_common::error::Result;
use sqlgate_common::METRICS;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Upper bound on submissions awaiting their response
const MAX_PENDING_REQUESTS: u64 = 100_000;

/// One inbound request, with its body already buffered by the forwarding layer
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,

    /// Per-request token correlating the request with its response
    pub correlation_token: String,
}

impl InboundRequest {
    /// Build a request from its method, `path[?query]`, headers and body
    pub fn new(method: Method, path_and_query: &str, headers: HeaderMap, body: Bytes) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path_and_query.to_string(), None),
        };
        Self {
            method,
            path,
            query,
            headers,
            body,
            correlation_token: Uuid::new_v4().to_string(),
        }
    }

    fn is_submission(&self) -> bool {
        self.method == Method::POST && extract::is_submission_path(&self.path)
    }
}

/// How a backend was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    QueryAffinity,
    UiAffinity,
    RoutingGroup,
    Adhoc,
}

impl RouteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteDecision::QueryAffinity => "query_affinity",
            RouteDecision::UiAffinity => "ui_affinity",
            RouteDecision::RoutingGroup => "routing_group",
            RouteDecision::Adhoc => "adhoc",
        }
    }
}

/// Where to forward a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Base URL of the chosen backend
    pub backend: String,

    /// Full URL to forward to
    pub target_url: String,

    /// Host header override requested via the proxy-target header
    pub host_override: Option<String>,

    pub query_id: Option<String>,
    pub decision: RouteDecision,
}

#[derive(Debug, Deserialize)]
struct SubmissionResponse {
    id: Option<String>,
}

/// Routing façade bound to one forwarding layer
pub struct RequestRouter {
    engine: Arc<RoutingEngine>,
    selector: RoutingGroupSelector,
    history: Arc<dyn QueryHistory>,

    /// Correlation token -> backend chosen for a request whose response is still pending
    pending: Cache<String, String>,
}

impl RequestRouter {
    pub fn new(
        engine: Arc<RoutingEngine>,
        selector: RoutingGroupSelector,
        history: Arc<dyn QueryHistory>,
        pending_ttl: Duration,
    ) -> Self {
        let pending = Cache::builder()
            .max_capacity(MAX_PENDING_REQUESTS)
            .time_to_live(pending_ttl)
            .build();
        Self {
            engine,
            selector,
            history,
            pending,
        }
    }

    pub fn engine(&self) -> &Arc<RoutingEngine> {
        &self.engine
    }

    /// Choose the backend for `request`.
    ///
    /// `Ok(None)` means the path is not load balanced and the forwarding layer keeps
    /// its default target. An error is returned only when no backend can be selected.
    pub async fn on_before_forward(&self, request: &InboundRequest) -> Result<Option<RouteTarget>> {
        if !extract::is_routed_path(&request.path) {
            debug!("Path {} is not load balanced", request.path);
            return Ok(None);
        }

        let query_id =
            extract::extract_query_id(&request.path, request.query.as_deref(), &request.body);

        let (backend, decision) = match &query_id {
            Some(query_id) => match self.engine.resolve_query_affinity(query_id).await {
                Some(backend) => (backend, RouteDecision::QueryAffinity),
                None => {
                    debug!("No backend owns query {}, selecting a new one", query_id);
                    self.select_new_backend(request)?
                }
            },
            None => match extract::ui_session_token(&request.headers) {
                Some(token) => (
                    self.engine.resolve_ui_affinity(&token).await?,
                    RouteDecision::UiAffinity,
                ),
                None => self.select_new_backend(request)?,
            },
        };

        // The response to a submission or a UI login reveals the identity to bind
        let awaits_identity = request.is_submission()
            || (extract::is_ui_path(&request.path)
                && extract::ui_session_token(&request.headers).is_none());
        if awaits_identity {
            self.pending
                .insert(request.correlation_token.clone(), backend.clone())
                .await;
        }

        METRICS
            .routing
            .requests_routed
            .with_label_values(&[decision.as_str()])
            .inc();

        let target_url = match &request.query {
            Some(query) => format!("{}{}?{}", backend, request.path, query),
            None => format!("{}{}", backend, request.path),
        };
        debug!(
            "Routing {} {} to {} ({})",
            request.method,
            request.path,
            target_url,
            decision.as_str()
        );

        Ok(Some(RouteTarget {
            backend,
            target_url,
            host_override: extract::host_override(&request.headers),
            query_id,
            decision,
        }))
    }

    /// Record identities revealed by the backend's response. Never fails; problems are logged.
    pub async fn on_after_response(
        &self,
        request: &InboundRequest,
        status: StatusCode,
        response_headers: &HeaderMap,
        body: &[u8],
    ) {
        // Single use: consumed whatever the outcome
        let pending = self.pending.remove(&request.correlation_token).await;
        let backend = extract::proxy_target(&request.headers).or(pending);

        if request.is_submission() {
            self.record_submission(request, status, response_headers, body, backend.as_deref())
                .await;
        } else if extract::is_ui_path(&request.path) {
            self.record_ui_session(response_headers, backend.as_deref())
                .await;
        }
    }

    fn select_new_backend(&self, request: &InboundRequest) -> Result<(String, RouteDecision)> {
        let facts = RequestFacts::new(request.method.as_str(), &request.path, &request.headers);
        match self.selector.find_routing_group(&facts) {
            Some(group) => {
                let backend = self
                    .engine
                    .select_backend_for_group(&group, facts.user.as_deref())?;
                Ok((backend, RouteDecision::RoutingGroup))
            }
            None => {
                let backend = self.engine.select_adhoc_backend(facts.user.as_deref())?;
                Ok((backend, RouteDecision::Adhoc))
            }
        }
    }

    async fn record_submission(
        &self,
        request: &InboundRequest,
        status: StatusCode,
        response_headers: &HeaderMap,
        body: &[u8],
        backend: Option<&str>,
    ) {
        let mut detail = QueryDetail::new(
            backend.map(str::to_string),
            extract::user(&request.headers),
            extract::source(&request.headers),
            &String::from_utf8_lossy(&request.body),
        );

        if status == StatusCode::OK {
            detail.query_id = self.bind_query_id(response_headers, body, backend).await;
        } else {
            error!(
                "Non OK HTTP status {} for submission to {:?}, query id not recorded",
                status, backend
            );
        }

        self.history.submit(detail);
    }

    /// Bind the query id of a successful submission response to `backend`
    async fn bind_query_id(
        &self,
        response_headers: &HeaderMap,
        body: &[u8],
        backend: Option<&str>,
    ) -> Option<String> {
        let decoded = match decode_body(response_headers, body) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("Error decoding submission response: {}", e);
                return None;
            }
        };

        match serde_json::from_slice::<SubmissionResponse>(&decoded) {
            Ok(SubmissionResponse { id: Some(query_id) }) => {
                match backend {
                    Some(backend) => self.engine.record_query_affinity(&query_id, backend).await,
                    None => warn!("No backend known for query {}, affinity not recorded", query_id),
                }
                Some(query_id)
            }
            Ok(_) => {
                warn!("Submission response carries no query id");
                None
            }
            Err(e) => {
                error!("Error parsing submission response: {}", e);
                None
            }
        }
    }

    async fn record_ui_session(&self, response_headers: &HeaderMap, backend: Option<&str>) {
        let tokens = extract::ui_tokens_from_set_cookie(response_headers);
        if tokens.is_empty() {
            return;
        }
        let backend = match backend {
            Some(backend) => backend,
            None => {
                warn!("UI session established by an unknown backend, affinity not recorded");
                return;
            }
        };
        for token in tokens {
            debug!("Binding UI session to backend {}", backend);
            self.engine.record_ui_affinity(&token, backend).await;
        }
    }
}

/// Response body with any gzip content encoding removed
fn decode_body(headers: &HeaderMap, body: &[u8]) -> std::io::Result<Vec<u8>> {
    let gzipped = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.to_ascii_lowercase().contains("gzip"));
    if !gzipped {
        return Ok(body.to_vec());
    }
    let mut decoded = Vec::new();
    GzDecoder::new(body).read_to_end(&mut decoded)?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::BoundedQueryHistory;
    use crate::routing::tests::{engine_with, fleet, MockProbe};
    use crate::routing::RoutingOptions;
    use crate::store::InMemoryAffinityStore;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use http::header::{COOKIE, SET_COOKIE};
    use http::HeaderValue;
    use std::io::Write;

    const QUERY_ID: &str = "20240101_000000_00001_xyz";

    struct Fixture {
        router: RequestRouter,
        probe: Arc<MockProbe>,
        history: Arc<BoundedQueryHistory>,
    }

    fn fixture() -> Fixture {
        let probe = Arc::new(MockProbe::default());
        let engine = Arc::new(engine_with(
            fleet(),
            Arc::new(InMemoryAffinityStore::new()),
            probe.clone(),
            RoutingOptions::default(),
        ));
        let history = Arc::new(BoundedQueryHistory::new(10));
        let router = RequestRouter::new(
            engine,
            RoutingGroupSelector::Header,
            history.clone(),
            Duration::from_secs(60),
        );
        Fixture {
            router,
            probe,
            history,
        }
    }

    fn user_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(extract::USER_HEADER, HeaderValue::from_static("alice"));
        headers
    }

    fn submission(body: &'static str) -> InboundRequest {
        InboundRequest::new(
            Method::POST,
            extract::V1_STATEMENT_PATH,
            user_headers(),
            Bytes::from_static(body.as_bytes()),
        )
    }

    fn get(path: &str) -> InboundRequest {
        InboundRequest::new(Method::GET, path, HeaderMap::new(), Bytes::new())
    }

    #[tokio::test]
    async fn test_submission_then_status_poll_hits_same_backend() {
        let f = fixture();
        let submit = submission("select 1");

        let target = f.router.on_before_forward(&submit).await.unwrap().unwrap();
        assert!(target.backend.starts_with("http://adhoc-"));
        assert_eq!(target.decision, RouteDecision::Adhoc);
        assert_eq!(target.target_url, format!("{}/v1/statement", target.backend));

        let body = format!(r#"{{"id":"{}","nextUri":"http://x/v1/statement/queued/{}/y/1"}}"#, QUERY_ID, QUERY_ID);
        f.router
            .on_after_response(&submit, StatusCode::OK, &HeaderMap::new(), body.as_bytes())
            .await;

        let poll = get(&format!("/v1/query/{}", QUERY_ID));
        let followup = f.router.on_before_forward(&poll).await.unwrap().unwrap();
        assert_eq!(followup.backend, target.backend);
        assert_eq!(followup.decision, RouteDecision::QueryAffinity);
        assert_eq!(f.probe.calls(), 0);

        let recent = f.history.recent(1);
        assert_eq!(recent[0].query_id.as_deref(), Some(QUERY_ID));
        assert_eq!(recent[0].backend_url.as_deref(), Some(target.backend.as_str()));
        assert_eq!(recent[0].user.as_deref(), Some("alice"));
        assert_eq!(recent[0].query_text, "select 1");
    }

    #[tokio::test]
    async fn test_kill_query_routes_to_recorded_backend() {
        let f = fixture();
        f.router
            .engine()
            .record_query_affinity("Q123", "http://etl-1:8080")
            .await;

        let kill = submission("CALL system.runtime.kill_query(query_id => 'Q123', message => 'stop')");
        let target = f.router.on_before_forward(&kill).await.unwrap().unwrap();

        assert_eq!(target.backend, "http://etl-1:8080");
        assert_eq!(target.query_id.as_deref(), Some("Q123"));
        assert_eq!(f.probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_gzip_submission_response_is_decoded() {
        let f = fixture();
        let submit = submission("select 2");
        let target = f.router.on_before_forward(&submit).await.unwrap().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(format!(r#"{{"id":"{}"}}"#, QUERY_ID).as_bytes())
            .unwrap();
        let compressed = encoder.finish().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        f.router
            .on_after_response(&submit, StatusCode::OK, &headers, &compressed)
            .await;

        let poll = get(&format!("/v1/query/{}", QUERY_ID));
        let followup = f.router.on_before_forward(&poll).await.unwrap().unwrap();
        assert_eq!(followup.backend, target.backend);
        assert_eq!(f.probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_submission_is_kept_in_history_without_affinity() {
        let f = fixture();
        let submit = submission("select broken");
        f.router.on_before_forward(&submit).await.unwrap().unwrap();

        let body = format!(r#"{{"id":"{}"}}"#, QUERY_ID);
        f.router
            .on_after_response(
                &submit,
                StatusCode::INTERNAL_SERVER_ERROR,
                &HeaderMap::new(),
                body.as_bytes(),
            )
            .await;
        let recent = f.history.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].query_id, None);
        assert_eq!(recent[0].query_text, "select broken");
        assert_eq!(recent[0].user.as_deref(), Some("alice"));

        // Unknown id: resolved by probing the fleet
        let poll = get(&format!("/v1/query/{}", QUERY_ID));
        f.router.on_before_forward(&poll).await.unwrap().unwrap();
        assert_eq!(f.probe.calls(), 3);
    }

    #[tokio::test]
    async fn test_undecodable_gzip_response_is_kept_in_history() {
        let f = fixture();
        let submit = submission("select 5");
        f.router.on_before_forward(&submit).await.unwrap().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        f.router
            .on_after_response(&submit, StatusCode::OK, &headers, b"not gzip at all")
            .await;

        let recent = f.history.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].query_id, None);
        assert_eq!(recent[0].query_text, "select 5");
    }

    #[tokio::test]
    async fn test_proxy_target_header_is_authoritative() {
        let f = fixture();
        let mut headers = user_headers();
        headers.insert(
            extract::PROXY_TARGET_HEADER,
            HeaderValue::from_static("http://etl-1:8080"),
        );
        let submit = InboundRequest::new(
            Method::POST,
            extract::V1_STATEMENT_PATH,
            headers,
            Bytes::from_static(b"select 3"),
        );

        let target = f.router.on_before_forward(&submit).await.unwrap().unwrap();
        assert_eq!(target.host_override.as_deref(), Some("etl-1:8080"));

        f.router
            .on_after_response(&submit, StatusCode::OK, &HeaderMap::new(), br#"{"id":"q-pinned"}"#)
            .await;
        let followup = f
            .router
            .on_before_forward(&get("/v1/query/q-pinned"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(followup.backend, "http://etl-1:8080");
    }

    #[tokio::test]
    async fn test_routing_group_header_selects_group() {
        let f = fixture();
        let mut headers = user_headers();
        headers.insert(extract::ROUTING_GROUP_HEADER, HeaderValue::from_static("etl"));
        let submit = InboundRequest::new(
            Method::POST,
            extract::V1_STATEMENT_PATH,
            headers,
            Bytes::from_static(b"select 4"),
        );

        let target = f.router.on_before_forward(&submit).await.unwrap().unwrap();
        assert_eq!(target.backend, "http://etl-1:8080");
        assert_eq!(target.decision, RouteDecision::RoutingGroup);
    }

    #[tokio::test]
    async fn test_ui_login_binds_session_to_backend() {
        let f = fixture();
        let login = get("/ui/login.html");
        let target = f.router.on_before_forward(&login).await.unwrap().unwrap();

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            SET_COOKIE,
            HeaderValue::from_static("Trino-UI-Token=tok-9; Path=/ui; HttpOnly"),
        );
        f.router
            .on_after_response(&login, StatusCode::OK, &response_headers, b"")
            .await;

        for _ in 0..5 {
            let mut headers = HeaderMap::new();
            headers.insert(COOKIE, HeaderValue::from_static("Trino-UI-Token=tok-9"));
            let page = InboundRequest::new(Method::GET, "/ui/api/cluster", headers, Bytes::new());
            let followup = f.router.on_before_forward(&page).await.unwrap().unwrap();
            assert_eq!(followup.backend, target.backend);
            assert_eq!(followup.decision, RouteDecision::UiAffinity);
        }
    }

    #[tokio::test]
    async fn test_unrouted_path_keeps_default_target() {
        let f = fixture();
        let request = get("/api/public/backends");
        assert!(f.router.on_before_forward(&request).await.unwrap().is_none());
    }

    #[test]
    fn test_request_splits_query_string() {
        let request = get("/ui/query.html?20240101_000000_00001_xyz");
        assert_eq!(request.path, "/ui/query.html");
        assert_eq!(request.query.as_deref(), Some(QUERY_ID));
        assert_ne!(request.correlation_token, get("/ui").correlation_token);
    }
}
