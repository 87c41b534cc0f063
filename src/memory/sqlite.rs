//! SQLite 存储（rusqlite，同步连接放在 spawn_blocking 中执行，避免阻塞 async 上下文）
//!
//! 每条记忆存为一行：id / type / agent_id 独立成列便于索引，完整条目以 JSON 存于 data 列；
//! 检索时在 Rust 侧打分排序，与内存存储共用 rank_entries。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::memory::entry::{
    cosine_similarity, keyword_score, rank_entries, MemoryEntry, MemoryPatch, QueryOptions,
    ScoredEntry,
};
use crate::memory::store::{HealthStatus, MemoryStore, StoreError, StoreMetrics};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS memory_entries (
    id TEXT PRIMARY KEY,
    entry_type TEXT NOT NULL,
    agent_id TEXT,
    timestamp TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memory_type ON memory_entries(entry_type);
CREATE INDEX IF NOT EXISTS idx_memory_agent ON memory_entries(agent_id);";

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn open(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(backend)?;
        }
    }
    let conn = Connection::open(path).map_err(backend)?;
    conn.execute_batch(SCHEMA).map_err(backend)?;
    Ok(conn)
}

fn upsert(conn: &Connection, entry: &MemoryEntry) -> Result<(), StoreError> {
    let data = serde_json::to_string(entry).map_err(backend)?;
    conn.execute(
        "INSERT OR REPLACE INTO memory_entries (id, entry_type, agent_id, timestamp, data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.id,
            entry.entry_type.as_str(),
            entry.agent_id,
            entry.timestamp.to_rfc3339(),
            data
        ],
    )
    .map_err(backend)?;
    Ok(())
}

fn load(conn: &Connection, id: &str) -> Result<Option<MemoryEntry>, StoreError> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM memory_entries WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend)?;
    data.map(|d| serde_json::from_str(&d).map_err(backend))
        .transpose()
}

fn load_all(conn: &Connection) -> Result<Vec<MemoryEntry>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT data FROM memory_entries ORDER BY timestamp ASC")
        .map_err(backend)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(backend)?;
    let mut entries = Vec::new();
    for row in rows {
        let data = row.map_err(backend)?;
        entries.push(serde_json::from_str(&data).map_err(backend)?);
    }
    Ok(entries)
}

/// SQLite 记忆存储
pub struct SqliteStore {
    name: String,
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
    operations: AtomicU64,
    errors: AtomicU64,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并建表
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = open(&path)?;
        Ok(Self {
            name: name.into(),
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
            operations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在阻塞线程池上使用连接
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::clone(&self.conn);
        let name = self.name.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("connection mutex poisoned".to_string()))?;
            match guard.as_ref() {
                Some(c) => f(c),
                None => Err(StoreError::NotConnected(name)),
            }
        })
        .await
        .map_err(backend)
        .and_then(|r| r);
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("connection mutex poisoned".to_string()))?;
            if guard.is_none() {
                *guard = Some(open(&path)?);
            }
            Ok(())
        })
        .await
        .map_err(backend)?
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("connection mutex poisoned".to_string()))?;
            if let Some(c) = guard.take() {
                c.close().map_err(|(_, e)| backend(e))?;
            }
            Ok(())
        })
        .await
        .map_err(backend)?
    }

    fn is_connected(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    async fn add(&self, entry: MemoryEntry) -> Result<String, StoreError> {
        entry.validate().map_err(StoreError::InvalidEntry)?;
        self.with_conn(move |conn| {
            upsert(conn, &entry)?;
            Ok(entry.id)
        })
        .await
    }

    async fn add_many(&self, entries: Vec<MemoryEntry>) -> Result<Vec<String>, StoreError> {
        if let Some(err) = entries.iter().find_map(|e| e.validate().err()) {
            return Err(StoreError::InvalidEntry(err));
        }
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(backend)?;
            for entry in &entries {
                upsert(&tx, entry)?;
            }
            tx.commit().map_err(backend)?;
            Ok(entries.into_iter().map(|e| e.id).collect())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| load(conn, &id)).await
    }

    async fn update(&self, id: &str, patch: &MemoryPatch) -> Result<MemoryEntry, StoreError> {
        let id = id.to_string();
        let patch = patch.clone();
        self.with_conn(move |conn| {
            let mut entry = load(conn, &id)?.ok_or_else(|| StoreError::NotFound(id.clone()))?;
            entry.apply(&patch);
            upsert(conn, &entry)?;
            Ok(entry)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute("DELETE FROM memory_entries WHERE id = ?1", params![id])
                .map_err(backend)?;
            Ok(n > 0)
        })
        .await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM memory_entries", [])
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn search(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        let query = query.to_string();
        let options = options.clone();
        self.with_conn(move |conn| {
            let candidates = load_all(conn)?.into_iter().map(|entry| {
                let base = keyword_score(&query, &entry.content);
                (entry, base)
            });
            Ok(rank_entries(candidates, &options))
        })
        .await
    }

    async fn similarity_search(
        &self,
        embedding: &[f32],
        options: &QueryOptions,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        let embedding = embedding.to_vec();
        let options = options.clone();
        self.with_conn(move |conn| {
            let candidates = load_all(conn)?.into_iter().filter_map(|entry| {
                let base = entry
                    .embedding
                    .as_ref()
                    .map(|e| cosine_similarity(&embedding, e))?;
                Some((entry, base))
            });
            Ok(rank_entries(candidates, &options))
        })
        .await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM memory_entries", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n.max(0) as u64)
            .map_err(backend)
        })
        .await
    }

    async fn metrics(&self) -> StoreMetrics {
        let entries = self.count().await.unwrap_or(0);
        StoreMetrics {
            store: self.name.clone(),
            operations: self.operations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            entries,
        }
    }

    async fn health_check(&self) -> HealthStatus {
        match self
            .with_conn(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(backend)
            })
            .await
        {
            Ok(_) => HealthStatus::healthy(&self.name),
            Err(e) => HealthStatus::unhealthy(&self.name, e.to_string()),
        }
    }
}
