//! 存储契约：所有后端驱动（内存 / SQLite / 外部 KV、关系库、向量库）实现 MemoryStore
//!
//! MemoryManager 只依赖此 trait；所有操作均为可失败的异步调用。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::entry::{MemoryEntry, MemoryPatch, QueryOptions, ScoredEntry};

/// 存储错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store {0} is not connected")]
    NotConnected(String),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    #[error("Backend error: {0}")]
    Backend(String),

    /// 主存储与所有 fallback 均失败
    #[error("All stores unavailable: {0}")]
    Unavailable(String),
}

/// 单个存储的运行统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreMetrics {
    pub store: String,
    pub operations: u64,
    pub errors: u64,
    pub entries: u64,
}

/// 健康检查结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub store: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthStatus {
    pub fn healthy(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            healthy: true,
            detail: None,
        }
    }

    pub fn unhealthy(store: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// 存储契约
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 存储名称（日志、指标、巡检报告使用）
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), StoreError>;

    async fn disconnect(&self) -> Result<(), StoreError>;

    fn is_connected(&self) -> bool;

    /// 写入一条，返回条目 ID
    async fn add(&self, entry: MemoryEntry) -> Result<String, StoreError>;

    async fn add_many(&self, entries: Vec<MemoryEntry>) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            ids.push(self.add(entry).await?);
        }
        Ok(ids)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, StoreError>;

    async fn update(&self, id: &str, patch: &MemoryPatch) -> Result<MemoryEntry, StoreError>;

    /// 删除；返回是否存在
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    /// 关键词检索（分数已经过 adjust_score 修正并降序）
    async fn search(&self, query: &str, options: &QueryOptions)
        -> Result<Vec<ScoredEntry>, StoreError>;

    /// 向量相似度检索
    async fn similarity_search(
        &self,
        embedding: &[f32],
        options: &QueryOptions,
    ) -> Result<Vec<ScoredEntry>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn metrics(&self) -> StoreMetrics;

    async fn health_check(&self) -> HealthStatus;
}
