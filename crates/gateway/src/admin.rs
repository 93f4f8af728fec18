//! Admin HTTP endpoint
//!
//! Serves `/healthz`, Prometheus `/metrics`, the latest cluster snapshot on
//! `/api/clusters` and recent submissions on `/api/queries`.

use crate::history::BoundedQueryHistory;
use crate::monitor::ClusterStatsBoard;
use http::header::CONTENT_TYPE;
use http::HeaderValue;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use sqlgate_common::METRICS;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Number of history records returned by `/api/queries`
const RECENT_QUERIES: usize = 100;

/// Read-only views exposed by the admin endpoint
pub struct AdminState {
    pub board: Arc<ClusterStatsBoard>,
    pub history: Arc<BoundedQueryHistory>,
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn respond_json<T: Serialize + ?Sized>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(StatusCode::OK, "application/json", body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            e.to_string(),
        ),
    }
}

/// Route one admin request
pub async fn admin_handler(
    state: Arc<AdminState>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" => respond(StatusCode::OK, "text/plain", "ok"),
        "/metrics" => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            METRICS.gather(),
        ),
        "/api/clusters" => respond_json(state.board.snapshot().as_slice()),
        "/api/queries" => respond_json(&state.history.recent(RECENT_QUERIES)),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(response)
}

/// Accept admin connections on `listener` until the task is dropped
pub async fn serve(listener: TcpListener, state: Arc<AdminState>) -> std::io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| admin_handler(Arc::clone(&state), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %e, "admin connection error");
            }
        });
    }
}

/// Bind `addr` and serve the admin endpoint
pub async fn start_admin_server(addr: SocketAddr, state: Arc<AdminState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Admin endpoint listening on {}", addr);
    serve(listener, state).await
}
