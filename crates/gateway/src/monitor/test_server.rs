//! Minimal scripted HTTP/1.1 responder for transport tests

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A canned response, chosen by method, request target and body content
#[derive(Debug, Clone)]
pub struct Route {
    pub method: &'static str,
    pub target: String,
    pub body_contains: Option<&'static str>,
    pub status: u16,

    /// Response body; `{base}` is replaced with the server's base URL
    pub body: String,
}

impl Route {
    pub fn get(target: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            method: "GET",
            target: target.into(),
            body_contains: None,
            status,
            body: body.into(),
        }
    }

    pub fn post(
        target: impl Into<String>,
        body_contains: &'static str,
        body: impl Into<String>,
    ) -> Self {
        Self {
            method: "POST",
            target: target.into(),
            body_contains: Some(body_contains),
            status: 200,
            body: body.into(),
        }
    }
}

/// Serve `routes` on an ephemeral local port.
///
/// Returns the base URL and a log of the raw requests received.
pub async fn serve(routes: Vec<Route>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let log = Arc::new(Mutex::new(Vec::new()));

    let server_base = base.clone();
    let server_log = log.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let routes = routes.clone();
            let base = server_base.clone();
            let log = server_log.clone();
            tokio::spawn(async move {
                respond(stream, &routes, &base, &log).await;
            });
        }
    });

    (base, log)
}

async fn respond(mut stream: TcpStream, routes: &[Route], base: &str, log: &Mutex<Vec<String>>) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while raw.len() < head_end + content_length {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        raw.extend_from_slice(&buf[..n]);
    }
    let body = String::from_utf8_lossy(&raw[head_end..]).to_string();
    log.lock().push(format!("{}{}", head, body));

    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default();
    let target = request_line.next().unwrap_or_default();

    let route = routes.iter().find(|route| {
        route.method == method
            && route.target == target
            && route.body_contains.map_or(true, |needle| body.contains(needle))
    });
    let (status, payload) = match route {
        Some(route) => (route.status, route.body.replace("{base}", base)),
        None => (404, String::new()),
    };

    let response = format!(
        "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        payload.len(),
        payload
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
