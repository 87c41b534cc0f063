//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__TOPOLOGY__MESH_MAX_ROUNDS=3`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSection,
    pub topology: TopologySection,
    pub memory: MemorySection,
    pub retry: RetrySection,
    pub llm: LlmSection,
}

/// [orchestrator] 段：智能选择执行器的循环上限与评分参考值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 分析-选择-执行 循环上限
    pub max_loops: u32,
    /// performance 分数的参考 token 预算
    pub reference_token_budget: u32,
    pub default_task_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_loops: 3,
            reference_token_budget: 4096,
            default_task_timeout_secs: 120,
        }
    }
}

/// [topology] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopologySection {
    /// Mesh 最大轮数（可被任务元数据 maxConcurrency 覆盖）
    pub mesh_max_rounds: u32,
    /// 并行分发时同时执行的 Agent 上限
    pub max_parallel_agents: usize,
    /// Hierarchical 无 worker 时是否允许仅协调者执行
    pub allow_coordinator_only: bool,
}

impl Default for TopologySection {
    fn default() -> Self {
        Self {
            mesh_max_rounds: 5,
            max_parallel_agents: 8,
            allow_coordinator_only: false,
        }
    }
}

/// [memory] 段：副本复制与一致性巡检
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub replication_enabled: bool,
    pub audit_interval_secs: u64,
    /// SQLite 目录；设置后每个 Agent 的主存储为 <sqlite_path>/<agent>.db，内存存储作为 fallback
    pub sqlite_path: Option<PathBuf>,
    /// SQLite 副本目录；每个目录下为该 Agent 建一个 <agent>.db 副本
    pub replica_paths: Vec<PathBuf>,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            replication_enabled: false,
            audit_interval_secs: 60,
            sqlite_path: None,
            replica_paths: Vec::new(),
        }
    }
}

/// [retry] 段：LLM 调用的默认重试配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.backoff_multiplier,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：mock / openai
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
