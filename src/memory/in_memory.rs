//! 内存存储：HashMap + 关键词重叠 / 余弦相似度检索
//!
//! 新建即处于已连接状态；disconnect 之后所有操作返回 NotConnected（可用来模拟后端故障）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::memory::entry::{
    cosine_similarity, keyword_score, rank_entries, MemoryEntry, MemoryPatch, QueryOptions,
    ScoredEntry,
};
use crate::memory::store::{HealthStatus, MemoryStore, StoreError, StoreMetrics};

pub struct InMemoryStore {
    name: String,
    entries: RwLock<HashMap<String, MemoryEntry>>,
    connected: AtomicBool,
    operations: AtomicU64,
    errors: AtomicU64,
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(true),
            operations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// 每次操作前计数并检查连接
    fn begin(&self) -> Result<(), StoreError> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        if self.connected.load(Ordering::Relaxed) {
            Ok(())
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
            Err(StoreError::NotConnected(self.name.clone()))
        }
    }

    fn fail<T>(&self, err: StoreError) -> Result<T, StoreError> {
        self.errors.fetch_add(1, Ordering::Relaxed);
        Err(err)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new("in-memory")
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), StoreError> {
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn add(&self, entry: MemoryEntry) -> Result<String, StoreError> {
        self.begin()?;
        if let Err(e) = entry.validate() {
            return self.fail(StoreError::InvalidEntry(e));
        }
        let id = entry.id.clone();
        self.entries.write().await.insert(id.clone(), entry);
        Ok(id)
    }

    async fn add_many(&self, entries: Vec<MemoryEntry>) -> Result<Vec<String>, StoreError> {
        self.begin()?;
        if let Some(err) = entries.iter().find_map(|e| e.validate().err()) {
            return self.fail(StoreError::InvalidEntry(err));
        }
        let mut map = self.entries.write().await;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let id = entry.id.clone();
                map.insert(id.clone(), entry);
                id
            })
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, StoreError> {
        self.begin()?;
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn update(&self, id: &str, patch: &MemoryPatch) -> Result<MemoryEntry, StoreError> {
        self.begin()?;
        let mut map = self.entries.write().await;
        match map.get_mut(id) {
            Some(entry) => {
                entry.apply(patch);
                Ok(entry.clone())
            }
            None => self.fail(StoreError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.begin()?;
        Ok(self.entries.write().await.remove(id).is_some())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.begin()?;
        self.entries.write().await.clear();
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        self.begin()?;
        let map = self.entries.read().await;
        let candidates = map
            .values()
            .map(|entry| (entry.clone(), keyword_score(query, &entry.content)));
        Ok(rank_entries(candidates, options))
    }

    async fn similarity_search(
        &self,
        embedding: &[f32],
        options: &QueryOptions,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        self.begin()?;
        let map = self.entries.read().await;
        let candidates = map.values().filter_map(|entry| {
            entry
                .embedding
                .as_ref()
                .map(|e| (entry.clone(), cosine_similarity(embedding, e)))
        });
        Ok(rank_entries(candidates, options))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.begin()?;
        Ok(self.entries.read().await.len() as u64)
    }

    async fn metrics(&self) -> StoreMetrics {
        StoreMetrics {
            store: self.name.clone(),
            operations: self.operations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            entries: self.entries.read().await.len() as u64,
        }
    }

    async fn health_check(&self) -> HealthStatus {
        if self.is_connected() {
            HealthStatus::healthy(&self.name)
        } else {
            HealthStatus::unhealthy(&self.name, "disconnected")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::entry::MemoryType;

    #[tokio::test]
    async fn test_add_get_update_delete() {
        let store = InMemoryStore::new("m");
        let id = store
            .add(MemoryEntry::new(MemoryType::Message, "hello world"))
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        let patch = MemoryPatch {
            importance: Some(0.9),
            ..Default::default()
        };
        let updated = store.update(&id, &patch).await.unwrap();
        assert_eq!(updated.importance, 0.9);

        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = InMemoryStore::new("m");
        let err = store.update("nope", &MemoryPatch::default()).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("nope".into()));
        assert_eq!(store.metrics().await.errors, 1);
    }

    #[tokio::test]
    async fn test_rejects_empty_content() {
        let store = InMemoryStore::new("m");
        let err = store
            .add(MemoryEntry::new(MemoryType::Message, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidEntry(_)));
    }

    #[tokio::test]
    async fn test_search_ranks_by_adjusted_score() {
        let store = InMemoryStore::new("m");
        store
            .add(
                MemoryEntry::new(MemoryType::Result, "deploy the rust service")
                    .with_id("low")
                    .with_importance(0.0),
            )
            .await
            .unwrap();
        store
            .add(
                MemoryEntry::new(MemoryType::Result, "deploy the rust service")
                    .with_id("high")
                    .with_importance(1.0),
            )
            .await
            .unwrap();
        store
            .add(MemoryEntry::new(MemoryType::Result, "unrelated").with_id("none"))
            .await
            .unwrap();

        let results = store
            .search("rust service", &QueryOptions::default())
            .await
            .unwrap();
        let ids: Vec<_> = results.iter().map(|s| s.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
        assert_eq!(results[0].score, 2.0);
    }

    #[tokio::test]
    async fn test_similarity_search_skips_entries_without_embedding() {
        let store = InMemoryStore::new("m");
        store
            .add(
                MemoryEntry::new(MemoryType::Message, "a")
                    .with_id("a")
                    .with_embedding(vec![1.0, 0.0]),
            )
            .await
            .unwrap();
        store
            .add(MemoryEntry::new(MemoryType::Message, "b").with_id("b"))
            .await
            .unwrap();
        let results = store
            .similarity_search(&[1.0, 0.0], &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.id, "a");
    }

    #[tokio::test]
    async fn test_disconnected_store_fails() {
        let store = InMemoryStore::new("m");
        store.disconnect().await.unwrap();
        assert!(matches!(
            store.count().await,
            Err(StoreError::NotConnected(_))
        ));
        assert!(!store.health_check().await.healthy);
        store.connect().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
