//! 核心层：任务模型、错误分类、执行指标，以及两种执行器
//!
//! - **task / error / metrics**：Task、RetryPolicy、TaskResult、ErrorKind、ExecutionMetrics
//! - **dispatch**：单次 Agent 调用（超时、取消、状态迁移）
//! - **topology**：sequential / parallel / hierarchical / mesh 四种拓扑
//! - **selection**：候选 Agent 打分与选择
//! - **agentic**：分析 → 选择 → 计划 → 执行 → fallback 的循环执行器

pub mod agentic;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod selection;
pub mod task;
pub mod topology;

pub use agentic::{AgenticConfig, AgenticExecutor, AgenticOutcome, StepRecord};
pub use dispatch::dispatch;
pub use error::{ErrorKind, LifecycleError, TaskError};
pub use metrics::ExecutionMetrics;
pub use selection::{select_best_agent_for_task, AgentSelectionResult};
pub use task::{RetryPolicy, Task, TaskId, TaskInput, TaskResult, TaskStatus, Usage};
pub use topology::{AgentOutcome, Topology, TopologyConfig, TopologyExecutor};
