//! Request identity extraction
//!
//! Pure functions that recognise query ids, UI session cookies and the
//! identity headers of the query-engine wire protocol.

use http::header::COOKIE;
use http::HeaderMap;
use lazy_static::lazy_static;
use regex::Regex;

pub const V1_STATEMENT_PATH: &str = "/v1/statement";
pub const V1_QUERY_PATH: &str = "/v1/query";
pub const V1_INFO_PATH: &str = "/v1/info";
pub const UI_PATH: &str = "/ui";
pub const UI_API_STATS_PATH: &str = "/ui/api/stats";
pub const UI_API_QUEUED_LIST_PATH: &str = "/ui/api/query?state=QUEUED";
pub const OAUTH2_PATH: &str = "/oauth2";
pub const INSIGHTS_STATEMENT_PATH: &str = "/ui/api/insights/ide/statement";

pub const USER_HEADER: &str = "X-Trino-User";
pub const ALTERNATE_USER_HEADER: &str = "X-Presto-User";
pub const SOURCE_HEADER: &str = "X-Trino-Source";
pub const ALTERNATE_SOURCE_HEADER: &str = "X-Presto-Source";
pub const ROUTING_GROUP_HEADER: &str = "X-Trino-Routing-Group";
pub const ALTERNATE_ROUTING_GROUP_HEADER: &str = "X-Presto-Routing-Group";
pub const PROXY_TARGET_HEADER: &str = "proxytarget";

pub const UI_TOKEN_COOKIE: &str = "Trino-UI-Token";
pub const OAUTH2_TOKEN_COOKIE: &str = "__Secure-Trino-OAuth2-Token";

const KILL_QUERY_TABLE: &str = "system.runtime.kill_query";

/// Sub-action segments that push the query id one segment further right
const QUERY_SUB_ACTIONS: [&str; 4] = ["queued", "scheduled", "executing", "partialCancel"];

lazy_static! {
    static ref QUERY_ID_PATTERN: Regex =
        Regex::new(r"^.*[/=?](\d+_\d+_\d+_\w+)").expect("valid query id regex");
    static ref QUOTED_LITERAL: Regex = Regex::new(r"'([^\s']+)'").expect("valid literal regex");
}

/// Paths the gateway load balances. Everything else goes to the default target.
pub fn is_routed_path(path: &str) -> bool {
    path.starts_with(V1_STATEMENT_PATH)
        || path.starts_with(V1_QUERY_PATH)
        || path.starts_with(UI_PATH)
        || path.starts_with(V1_INFO_PATH)
        || path.starts_with(UI_API_STATS_PATH)
        || path.starts_with(OAUTH2_PATH)
}

/// Whether a POST to `path` submits a new query
pub fn is_submission_path(path: &str) -> bool {
    path.starts_with(V1_STATEMENT_PATH) || path.starts_with(INSIGHTS_STATEMENT_PATH)
}

/// Whether `path` belongs to the web UI or its login flow
pub fn is_ui_path(path: &str) -> bool {
    path.starts_with(UI_PATH) || path.starts_with(OAUTH2_PATH)
}

/// Query id targeted by a kill-query control statement, if `body` is one
pub fn extract_kill_query_id(body: &str) -> Option<String> {
    if !body.to_lowercase().contains(KILL_QUERY_TABLE) {
        return None;
    }
    body.split(',')
        .filter(|part| part.to_lowercase().contains("query_id"))
        .find_map(|part| QUOTED_LITERAL.captures(part))
        .map(|captures| captures[1].to_string())
}

/// Query id carried by the request path (and query string, for UI pages)
pub fn extract_query_id_from_path(path: &str, query: Option<&str>) -> Option<String> {
    if path.starts_with(V1_STATEMENT_PATH) || path.starts_with(V1_QUERY_PATH) {
        let tokens: Vec<&str> = path.split('/').collect();
        if tokens.len() < 4 {
            return None;
        }
        let index = if QUERY_SUB_ACTIONS.iter().any(|action| path.contains(action)) {
            4
        } else {
            3
        };
        return tokens
            .get(index)
            .filter(|token| !token.is_empty())
            .map(|token| token.to_string());
    }

    if path.starts_with(UI_PATH) {
        let location = match query {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        };
        return QUERY_ID_PATTERN
            .captures(&location)
            .map(|captures| captures[1].to_string());
    }

    None
}

/// Query id of the request: kill-query body first, then the path
pub fn extract_query_id(path: &str, query: Option<&str>, body: &[u8]) -> Option<String> {
    if !body.is_empty() {
        if let Ok(text) = std::str::from_utf8(body) {
            if let Some(query_id) = extract_kill_query_id(text) {
                return Some(query_id);
            }
        }
    }
    extract_query_id_from_path(path, query)
}

/// Value of the first of `names` present in `headers`
pub fn header_value(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    })
}

/// User identity of the request
pub fn user(headers: &HeaderMap) -> Option<String> {
    header_value(headers, &[USER_HEADER, ALTERNATE_USER_HEADER])
}

/// Client source of the request
pub fn source(headers: &HeaderMap) -> Option<String> {
    header_value(headers, &[SOURCE_HEADER, ALTERNATE_SOURCE_HEADER])
}

/// Routing group requested through headers
pub fn routing_group_header(headers: &HeaderMap) -> Option<String> {
    header_value(headers, &[ROUTING_GROUP_HEADER, ALTERNATE_ROUTING_GROUP_HEADER])
}

/// Backend named by the proxy-target header
pub fn proxy_target(headers: &HeaderMap) -> Option<String> {
    header_value(headers, &[PROXY_TARGET_HEADER]).filter(|value| !value.is_empty())
}

fn is_ui_token_cookie(name: &str) -> bool {
    name == UI_TOKEN_COOKIE || name == OAUTH2_TOKEN_COOKIE
}

/// UI session token from the request cookies
pub fn ui_session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| is_ui_token_cookie(name.trim()))
        .map(|(_, value)| value.trim().to_string())
}

/// UI session tokens established by a response's `Set-Cookie` headers.
///
/// Empty values (cookie deletion) are skipped.
pub fn ui_tokens_from_set_cookie(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(http::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(name, value)| is_ui_token_cookie(name.trim()) && !value.trim().is_empty())
        .map(|(_, value)| value.trim().to_string())
        .collect()
}

/// `host[:port]` for the forwarded Host header, taken from the proxy-target header
pub fn host_override(headers: &HeaderMap) -> Option<String> {
    let target = proxy_target(headers)?;
    let uri = match target.parse::<http::Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            tracing::warn!("Invalid proxy target {}: {}", target, e);
            return None;
        }
    };
    let host = uri.host()?;
    Some(match uri.port_u16() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
