//! Query submission history
//!
//! Every submission response produces one `QueryDetail` that is handed to a
//! `QueryHistory` sink. The gateway never reads these back for routing.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::SystemTime;

/// Maximum number of query text characters kept per record
pub const QUERY_TEXT_LENGTH_FOR_HISTORY: usize = 200;

/// Audit record for one query submission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryDetail {
    pub query_id: Option<String>,
    pub backend_url: Option<String>,
    pub user: Option<String>,
    pub source: Option<String>,
    pub captured_at: SystemTime,
    pub query_text: String,
}

impl QueryDetail {
    /// Create a record, truncating the query text to the history snippet length
    pub fn new(
        backend_url: Option<String>,
        user: Option<String>,
        source: Option<String>,
        query_text: &str,
    ) -> Self {
        Self {
            query_id: None,
            backend_url,
            user,
            source,
            captured_at: SystemTime::now(),
            query_text: snippet(query_text),
        }
    }
}

fn snippet(query_text: &str) -> String {
    match query_text.char_indices().nth(QUERY_TEXT_LENGTH_FOR_HISTORY) {
        Some((cut, _)) => format!("{}...", &query_text[..cut]),
        None => query_text.to_string(),
    }
}

/// Sink for submission records
pub trait QueryHistory: Send + Sync {
    fn submit(&self, detail: QueryDetail);
}

/// Fixed-size in-memory history, newest first
#[derive(Debug)]
pub struct BoundedQueryHistory {
    capacity: usize,
    entries: Mutex<VecDeque<QueryDetail>>,
}

impl BoundedQueryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    /// The `limit` most recent records, newest first
    pub fn recent(&self, limit: usize) -> Vec<QueryDetail> {
        self.entries.lock().iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl QueryHistory for BoundedQueryHistory {
    fn submit(&self, detail: QueryDetail) {
        let mut entries = self.entries.lock();
        entries.push_front(detail);
        entries.truncate(self.capacity);
    }
}
