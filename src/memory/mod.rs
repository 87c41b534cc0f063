//! 记忆层：条目模型、存储契约、内置后端（内存 / SQLite）与多后端管理器
//!
//! - `entry`：MemoryEntry、查询选项与分数修正
//! - `store`：所有后端实现的 MemoryStore trait
//! - `manager`：主存储 + fallback + 副本的容错门面
//! - `audit`：主存储与副本的一致性巡检

pub mod audit;
pub mod entry;
pub mod in_memory;
pub mod manager;
pub mod sqlite;
pub mod store;

pub use audit::{audit_once, ConsistencyReport, ReplicaDrift};
pub use entry::{
    adjust_score, MemoryEntry, MemoryPatch, MemoryRole, MemoryType, QueryOptions, ScoredEntry,
};
pub use in_memory::InMemoryStore;
pub use manager::{MemoryManager, MemoryManagerConfig};
pub use sqlite::SqliteStore;
pub use store::{HealthStatus, MemoryStore, StoreError, StoreMetrics};
