//! MemoryManager：多后端记忆存储门面
//!
//! 组成：一个主存储 + 有序 fallback 存储 + 分布式副本。
//! - 写：主存储 → 依次 fallback（首个成功即返回）；开启复制时另外写所有副本，副本失败只记日志，由巡检暴露
//! - 读：主存储 → fallback → 副本，返回首个命中
//! - 检索：主存储 → fallback（首个成功，不合并）；全部失败时并发查询副本，按 ID 去重保留最高分
//! - 更新 / 删除：主存储（带 fallback），再尽力同步到副本（错误吞掉）
//! - 巡检：后台按固定间隔比较主存储与副本的条目数，只检测不修复

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::MemorySection;
use crate::memory::audit::{audit_once, ConsistencyReport};
use crate::memory::entry::{sort_by_score_desc, MemoryEntry, MemoryPatch, QueryOptions, ScoredEntry};
use crate::memory::in_memory::InMemoryStore;
use crate::memory::sqlite::SqliteStore;
use crate::memory::store::{HealthStatus, MemoryStore, StoreError, StoreMetrics};

/// 复制与巡检配置
#[derive(Debug, Clone)]
pub struct MemoryManagerConfig {
    pub replication_enabled: bool,
    pub audit_interval: Duration,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            replication_enabled: false,
            audit_interval: Duration::from_secs(60),
        }
    }
}

impl From<&MemorySection> for MemoryManagerConfig {
    fn from(section: &MemorySection) -> Self {
        Self {
            replication_enabled: section.replication_enabled,
            audit_interval: Duration::from_secs(section.audit_interval_secs.max(1)),
        }
    }
}

/// 记忆管理器；每个 Agent 独占一个实例
pub struct MemoryManager {
    primary: Arc<dyn MemoryStore>,
    fallbacks: Vec<Arc<dyn MemoryStore>>,
    replicas: Vec<Arc<dyn MemoryStore>>,
    config: MemoryManagerConfig,
    audit_cancel: Mutex<Option<CancellationToken>>,
    reports: Arc<watch::Sender<Option<ConsistencyReport>>>,
}

impl MemoryManager {
    pub fn new(primary: Arc<dyn MemoryStore>) -> Self {
        let (reports, _) = watch::channel(None);
        Self {
            primary,
            fallbacks: Vec::new(),
            replicas: Vec::new(),
            config: MemoryManagerConfig::default(),
            audit_cancel: Mutex::new(None),
            reports: Arc::new(reports),
        }
    }

    /// 仅使用一个内存主存储
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(Arc::new(InMemoryStore::new(name)))
    }

    /// 按 [memory] 配置创建：设置了 sqlite_path 时主存储为 SQLite，内存存储作为 fallback；
    /// replica_paths 中每个目录一个 SQLite 副本。开启复制且有副本时立即启动后台巡检
    pub fn from_config(section: &MemorySection, owner: &str) -> Result<Self, StoreError> {
        let mut manager = match &section.sqlite_path {
            Some(path) => {
                let file = path.join(format!("{owner}.db"));
                Self::new(Arc::new(SqliteStore::open(format!("{owner}-sqlite"), file)?))
                    .with_fallback(Arc::new(InMemoryStore::new(format!("{owner}-fallback"))))
            }
            None => Self::in_memory(format!("{owner}-memory")),
        };
        for (index, dir) in section.replica_paths.iter().enumerate() {
            let file = dir.join(format!("{owner}.db"));
            let replica = SqliteStore::open(format!("{owner}-replica-{}", index + 1), file)?;
            manager = manager.with_replica(Arc::new(replica));
        }
        let manager = manager.with_config(MemoryManagerConfig::from(section));
        if manager.config.replication_enabled && !manager.replicas.is_empty() {
            manager.start_consistency_audit();
        }
        Ok(manager)
    }

    pub fn with_fallback(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.fallbacks.push(store);
        self
    }

    pub fn with_replica(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.replicas.push(store);
        self
    }

    pub fn with_config(mut self, config: MemoryManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    /// 主存储 + fallback，按顺序
    fn chain(&self) -> impl Iterator<Item = &Arc<dyn MemoryStore>> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }

    fn all_stores(&self) -> impl Iterator<Item = &Arc<dyn MemoryStore>> {
        self.chain().chain(self.replicas.iter())
    }

    /// 对所有副本并发执行写操作；失败只记日志
    async fn replicate<F, Fut, T>(&self, op_name: &str, op: F)
    where
        F: Fn(Arc<dyn MemoryStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let results = join_all(self.replicas.iter().map(|r| {
            let name = r.name().to_string();
            let fut = op(Arc::clone(r));
            async move { (name, fut.await) }
        }))
        .await;
        for (replica, result) in results {
            if let Err(e) = result {
                tracing::warn!(replica = %replica, op = op_name, "replica write failed: {}", e);
            }
        }
    }

    /// 在主存储与 fallback 上依次尝试，返回首个成功结果
    async fn first_success<F, Fut, T>(&self, op_name: &str, op: F) -> Result<T, StoreError>
    where
        F: Fn(Arc<dyn MemoryStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut last_error = None;
        for store in self.chain() {
            match op(Arc::clone(store)).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(store = store.name(), op = op_name, "store operation failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        Err(StoreError::Unavailable(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no store configured".to_string()),
        ))
    }

    pub async fn add(&self, entry: MemoryEntry) -> Result<String, StoreError> {
        let result = self
            .first_success("add", |store| {
                let entry = entry.clone();
                async move { store.add(entry).await }
            })
            .await;
        if self.config.replication_enabled {
            self.replicate("add", |store| {
                let entry = entry.clone();
                async move { store.add(entry).await }
            })
            .await;
        }
        result
    }

    pub async fn add_many(&self, entries: Vec<MemoryEntry>) -> Result<Vec<String>, StoreError> {
        let result = self
            .first_success("add_many", |store| {
                let entries = entries.clone();
                async move { store.add_many(entries).await }
            })
            .await;
        if self.config.replication_enabled {
            self.replicate("add_many", |store| {
                let entries = entries.clone();
                async move { store.add_many(entries).await }
            })
            .await;
        }
        result
    }

    /// 读取：主存储 → fallback → 副本；失败或未命中都继续下一个。
    /// 只有当所有存储都报错时才返回 Unavailable
    pub async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, StoreError> {
        let mut answered = false;
        let mut last_error = None;
        for store in self.all_stores() {
            match store.get(id).await {
                Ok(Some(entry)) => return Ok(Some(entry)),
                Ok(None) => answered = true,
                Err(e) => {
                    tracing::debug!(store = store.name(), "get failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        match (answered, last_error) {
            (false, Some(e)) => Err(StoreError::Unavailable(e.to_string())),
            _ => Ok(None),
        }
    }

    pub async fn search(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        self.search_with("search", options, |store| async move {
            store.search(query, options).await
        })
        .await
    }

    pub async fn similarity_search(
        &self,
        embedding: &[f32],
        options: &QueryOptions,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        self.search_with("similarity_search", options, |store| async move {
            store.similarity_search(embedding, options).await
        })
        .await
    }

    async fn search_with<F, Fut>(
        &self,
        op_name: &str,
        options: &QueryOptions,
        op: F,
    ) -> Result<Vec<ScoredEntry>, StoreError>
    where
        F: Fn(Arc<dyn MemoryStore>) -> Fut,
        Fut: Future<Output = Result<Vec<ScoredEntry>, StoreError>>,
    {
        let primary_error = match self.first_success(op_name, &op).await {
            Ok(results) => return Ok(results),
            Err(e) => e,
        };
        if self.replicas.is_empty() {
            return Err(primary_error);
        }

        tracing::warn!(op = op_name, "primary and fallbacks failed, querying replicas");
        let results = join_all(self.replicas.iter().map(|r| op(Arc::clone(r)))).await;

        let mut any_success = false;
        let mut merged: HashMap<String, ScoredEntry> = HashMap::new();
        for (replica, result) in self.replicas.iter().zip(results) {
            match result {
                Ok(entries) => {
                    any_success = true;
                    for scored in entries {
                        match merged.get(&scored.entry.id) {
                            Some(existing) if existing.score >= scored.score => {}
                            _ => {
                                merged.insert(scored.entry.id.clone(), scored);
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(replica = replica.name(), op = op_name, "replica query failed: {}", e),
            }
        }
        if !any_success {
            return Err(primary_error);
        }

        let mut merged: Vec<ScoredEntry> = merged.into_values().collect();
        sort_by_score_desc(&mut merged);
        if let Some(limit) = options.limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    pub async fn update(&self, id: &str, patch: &MemoryPatch) -> Result<MemoryEntry, StoreError> {
        let result = self
            .first_success("update", |store| async move { store.update(id, patch).await })
            .await;
        if self.config.replication_enabled {
            self.replicate("update", |store| async move { store.update(id, patch).await })
                .await;
        }
        result
    }

    /// 删除：任一存储删除成功即返回 true；全部报错时返回 Unavailable
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut answered = false;
        let mut deleted = false;
        let mut last_error = None;
        for store in self.chain() {
            match store.delete(id).await {
                Ok(true) => {
                    deleted = true;
                    break;
                }
                Ok(false) => answered = true,
                Err(e) => {
                    tracing::warn!(store = store.name(), "delete failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        if self.config.replication_enabled {
            self.replicate("delete", |store| async move { store.delete(id).await })
                .await;
        }
        match (deleted || answered, last_error) {
            (false, Some(e)) => Err(StoreError::Unavailable(e.to_string())),
            _ => Ok(deleted),
        }
    }

    /// 清空主存储与所有 fallback；副本尽力清空
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut cleared = false;
        let mut last_error = None;
        for store in self.chain() {
            match store.clear().await {
                Ok(()) => cleared = true,
                Err(e) => {
                    tracing::warn!(store = store.name(), "clear failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        if self.config.replication_enabled {
            self.replicate("clear", |store| async move { store.clear().await })
                .await;
        }
        match (cleared, last_error) {
            (false, Some(e)) => Err(StoreError::Unavailable(e.to_string())),
            _ => Ok(()),
        }
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.first_success("count", |store| async move { store.count().await })
            .await
    }

    /// 连接所有存储；只有主存储连接失败才返回错误
    pub async fn connect(&self) -> Result<(), StoreError> {
        self.primary.connect().await?;
        for store in self.fallbacks.iter().chain(self.replicas.iter()) {
            if let Err(e) = store.connect().await {
                tracing::warn!(store = store.name(), "connect failed: {}", e);
            }
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), StoreError> {
        self.stop_consistency_audit();
        let mut first_error = None;
        for store in self.all_stores() {
            if let Err(e) = store.disconnect().await {
                tracing::warn!(store = store.name(), "disconnect failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn health_check(&self) -> Vec<HealthStatus> {
        join_all(self.all_stores().map(|s| s.health_check())).await
    }

    pub async fn metrics(&self) -> Vec<StoreMetrics> {
        join_all(self.all_stores().map(|s| s.metrics())).await
    }

    /// 立即执行一次一致性巡检并发布报告
    pub async fn run_consistency_audit(&self) -> ConsistencyReport {
        let report = audit_once(&self.primary, &self.replicas).await;
        self.reports.send_replace(Some(report.clone()));
        report
    }

    /// 订阅巡检报告
    pub fn audit_reports(&self) -> watch::Receiver<Option<ConsistencyReport>> {
        self.reports.subscribe()
    }

    /// 启动后台巡检；未开启复制、没有副本、已在运行或不在 tokio 运行时中时返回 false
    pub fn start_consistency_audit(&self) -> bool {
        if !self.config.replication_enabled || self.replicas.is_empty() {
            return false;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                tracing::warn!("consistency audit requires a tokio runtime");
                return false;
            }
        };
        let mut guard = self.audit_cancel.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let cancel = token.clone();
        let primary = Arc::clone(&self.primary);
        let replicas = self.replicas.clone();
        let reports = Arc::clone(&self.reports);
        let period = self.config.audit_interval;

        handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = audit_once(&primary, &replicas).await;
                        reports.send_replace(Some(report));
                    }
                }
            }
            tracing::debug!("consistency audit stopped");
        });
        tracing::info!(
            interval_secs = period.as_secs(),
            replicas = self.replicas.len(),
            "consistency audit started"
        );
        *guard = Some(token);
        true
    }

    pub fn stop_consistency_audit(&self) {
        let mut guard = self.audit_cancel.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = guard.take() {
            token.cancel();
        }
    }

    pub fn is_audit_running(&self) -> bool {
        self.audit_cancel
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.stop_consistency_audit();
    }
}
