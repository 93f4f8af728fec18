//! Durable identity -> backend mappings beneath the in-memory affinity caches.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sqlgate_common::Result;
use std::fmt;
use std::time::SystemTime;

/// Affinity namespaces. Keys in different namespaces never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Query id -> backend
    Query,
    /// UI session token -> backend
    Ui,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Query => "query",
            Namespace::Ui => "ui",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted affinity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffinityRecord {
    pub identity_key: String,
    pub backend_url: String,
    pub created_at: SystemTime,
}

/// Abstract key/value persistence for affinities.
///
/// Callers treat every error as "absent"; a storage failure never fails a request.
#[async_trait]
pub trait AffinityStore: Send + Sync {
    /// Create or overwrite the mapping for `key`
    async fn put(&self, namespace: Namespace, key: &str, backend_url: &str) -> Result<()>;

    /// Look up the backend recorded for `key`
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<String>>;

    /// Delete the mapping. Returns whether a record existed.
    async fn delete(&self, namespace: Namespace, key: &str) -> Result<bool>;
}

/// Process-local store. Records never expire; they must be deleted explicitly.
#[derive(Debug, Default)]
pub struct InMemoryAffinityStore {
    records: DashMap<(Namespace, String), AffinityRecord>,
}

impl InMemoryAffinityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full record for `key`, including its creation time
    pub fn record(&self, namespace: Namespace, key: &str) -> Option<AffinityRecord> {
        self.records
            .get(&(namespace, key.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Number of records in `namespace`
    pub fn len(&self, namespace: Namespace) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .count()
    }
}

#[async_trait]
impl AffinityStore for InMemoryAffinityStore {
    async fn put(&self, namespace: Namespace, key: &str, backend_url: &str) -> Result<()> {
        // Whole-record replacement keeps readers from seeing a mix of two writes
        self.records.insert(
            (namespace, key.to_string()),
            AffinityRecord {
                identity_key: key.to_string(),
                backend_url: backend_url.to_string(),
                created_at: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<String>> {
        Ok(self
            .records
            .get(&(namespace, key.to_string()))
            .map(|entry| entry.backend_url.clone()))
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<bool> {
        Ok(self.records.remove(&(namespace, key.to_string())).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let store = InMemoryAffinityStore::new();
        store
            .put(Namespace::Query, "same-key", "http://a:8080")
            .await
            .unwrap();
        store
            .put(Namespace::Ui, "same-key", "http://b:8080")
            .await
            .unwrap();

        assert_eq!(
            store.get(Namespace::Query, "same-key").await.unwrap().as_deref(),
            Some("http://a:8080")
        );
        assert_eq!(
            store.get(Namespace::Ui, "same-key").await.unwrap().as_deref(),
            Some("http://b:8080")
        );
        assert_eq!(store.len(Namespace::Query), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = InMemoryAffinityStore::new();
        store.put(Namespace::Ui, "token", "http://a:8080").await.unwrap();

        let record = store.record(Namespace::Ui, "token").unwrap();
        assert_eq!(record.identity_key, "token");

        assert!(store.delete(Namespace::Ui, "token").await.unwrap());
        assert!(!store.delete(Namespace::Ui, "token").await.unwrap());
        assert!(store.get(Namespace::Ui, "token").await.unwrap().is_none());
    }
}
