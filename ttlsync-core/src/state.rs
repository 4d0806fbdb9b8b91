//! Sync-state store abstraction
//!
//! The store is the single source of truth for "what was last synced": one
//! fingerprint per (dataset, model) plus a bidirectional identifier mapping
//! between graph ids and platform ids. Entries are created and updated but
//! never deleted by the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::document::dataset_key;
use crate::error::Result;
use crate::fingerprint::Fingerprint;

/// One stored fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub dataset_id: String,
    pub model: String,
    pub fingerprint: Fingerprint,
    /// Unix timestamp (seconds) of the last write
    pub updated_at: i64,
}

/// Persistent sync state
///
/// Any error is fatal for the run.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Fingerprint committed by the last successful sync of a group
    async fn get(&self, dataset_id: &str, model: &str) -> Result<Option<Fingerprint>>;

    /// Record a group as synced
    async fn put(&self, dataset_id: &str, model: &str, fingerprint: &Fingerprint) -> Result<()>;

    /// Platform id for a graph id
    async fn get_identifier_mapping(&self, ttl_id: &str) -> Result<Option<String>>;

    /// Graph id for a platform id
    async fn get_source_identifier(&self, platform_id: &str) -> Result<Option<String>>;

    /// Store or replace a mapping; both directions stay one-to-one
    async fn put_identifier_mapping(&self, ttl_id: &str, platform_id: &str) -> Result<()>;

    /// Stored fingerprints, optionally for one dataset, ordered by dataset then model
    async fn entries(&self, dataset_id: Option<&str>) -> Result<Vec<StateEntry>>;

    /// Platform id of a dataset, when it differs from the graph id
    async fn get_dataset_mapping(&self, dataset_id: &str) -> Result<Option<String>> {
        self.get_identifier_mapping(&dataset_key(dataset_id)).await
    }

    async fn put_dataset_mapping(&self, dataset_id: &str, platform_id: &str) -> Result<()> {
        self.put_identifier_mapping(&dataset_key(dataset_id), platform_id)
            .await
    }
}

#[derive(Default)]
struct MemoryInner {
    fingerprints: BTreeMap<(String, String), (Fingerprint, i64)>,
    forward: BTreeMap<String, String>,
    reverse: BTreeMap<String, String>,
}

/// In-memory store for tests and dry runs
#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every entry of another store, e.g. to dry-run against a snapshot.
    pub async fn snapshot_of(store: &dyn SyncStateStore) -> Result<Self> {
        let snapshot = Self::new();
        {
            let mut inner = snapshot.inner.write().await;
            for entry in store.entries(None).await? {
                inner
                    .fingerprints
                    .insert((entry.dataset_id, entry.model), (entry.fingerprint, entry.updated_at));
            }
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl SyncStateStore for MemoryStateStore {
    async fn get(&self, dataset_id: &str, model: &str) -> Result<Option<Fingerprint>> {
        let inner = self.inner.read().await;
        Ok(inner
            .fingerprints
            .get(&(dataset_id.to_string(), model.to_string()))
            .map(|(fp, _)| *fp))
    }

    async fn put(&self, dataset_id: &str, model: &str, fingerprint: &Fingerprint) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.fingerprints.insert(
            (dataset_id.to_string(), model.to_string()),
            (*fingerprint, chrono::Utc::now().timestamp()),
        );
        Ok(())
    }

    async fn get_identifier_mapping(&self, ttl_id: &str) -> Result<Option<String>> {
        Ok(self.inner.read().await.forward.get(ttl_id).cloned())
    }

    async fn get_source_identifier(&self, platform_id: &str) -> Result<Option<String>> {
        Ok(self.inner.read().await.reverse.get(platform_id).cloned())
    }

    async fn put_identifier_mapping(&self, ttl_id: &str, platform_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(old_platform) = inner.forward.remove(ttl_id) {
            inner.reverse.remove(&old_platform);
        }
        if let Some(old_ttl) = inner.reverse.remove(platform_id) {
            inner.forward.remove(&old_ttl);
        }
        inner.forward.insert(ttl_id.to_string(), platform_id.to_string());
        inner.reverse.insert(platform_id.to_string(), ttl_id.to_string());
        Ok(())
    }

    async fn entries(&self, dataset_id: Option<&str>) -> Result<Vec<StateEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .fingerprints
            .iter()
            .filter(|((ds, _), _)| dataset_id.map_or(true, |wanted| ds == wanted))
            .map(|((ds, model), (fp, at))| StateEntry {
                dataset_id: ds.clone(),
                model: model.clone(),
                fingerprint: *fp,
                updated_at: *at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_put() {
        let store = MemoryStateStore::new();
        assert_eq!(store.get("D1", "sample").await.unwrap(), None);

        let fp = Fingerprint::new([1u8; 32]);
        store.put("D1", "sample", &fp).await.unwrap();
        assert_eq!(store.get("D1", "sample").await.unwrap(), Some(fp));
        assert_eq!(store.get("D1", "subject").await.unwrap(), None);

        let fp2 = Fingerprint::new([2u8; 32]);
        store.put("D1", "sample", &fp2).await.unwrap();
        assert_eq!(store.get("D1", "sample").await.unwrap(), Some(fp2));
    }

    #[tokio::test]
    async fn test_identifier_mapping_bidirectional() {
        let store = MemoryStateStore::new();
        store.put_identifier_mapping("D1|sample|id:1", "P-1").await.unwrap();
        assert_eq!(
            store.get_identifier_mapping("D1|sample|id:1").await.unwrap().as_deref(),
            Some("P-1")
        );
        assert_eq!(
            store.get_source_identifier("P-1").await.unwrap().as_deref(),
            Some("D1|sample|id:1")
        );

        store.put_identifier_mapping("D1|sample|id:1", "P-2").await.unwrap();
        assert_eq!(store.get_source_identifier("P-1").await.unwrap(), None);
        assert_eq!(
            store.get_source_identifier("P-2").await.unwrap().as_deref(),
            Some("D1|sample|id:1")
        );
    }

    #[tokio::test]
    async fn test_dataset_mapping() {
        let store = MemoryStateStore::new();
        assert_eq!(store.get_dataset_mapping("N:dataset:1").await.unwrap(), None);
        store.put_dataset_mapping("N:dataset:1", "N:dataset:9").await.unwrap();
        assert_eq!(
            store.get_dataset_mapping("N:dataset:1").await.unwrap().as_deref(),
            Some("N:dataset:9")
        );
        assert_eq!(
            store.get_source_identifier("N:dataset:9").await.unwrap().as_deref(),
            Some("dataset|N:dataset:1")
        );
    }

    #[tokio::test]
    async fn test_entries_filter() {
        let store = MemoryStateStore::new();
        let fp = Fingerprint::empty();
        store.put("D2", "sample", &fp).await.unwrap();
        store.put("D1", "subject", &fp).await.unwrap();
        store.put("D1", "sample", &fp).await.unwrap();

        let all = store.entries(None).await.unwrap();
        let keys: Vec<_> = all.iter().map(|e| (e.dataset_id.as_str(), e.model.as_str())).collect();
        assert_eq!(keys, vec![("D1", "sample"), ("D1", "subject"), ("D2", "sample")]);

        assert_eq!(store.entries(Some("D2")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let store = MemoryStateStore::new();
        let fp = Fingerprint::new([3u8; 32]);
        store.put("D1", "sample", &fp).await.unwrap();

        let snapshot = MemoryStateStore::snapshot_of(&store).await.unwrap();
        snapshot.put("D1", "sample", &Fingerprint::empty()).await.unwrap();
        assert_eq!(store.get("D1", "sample").await.unwrap(), Some(fp));
    }
}
