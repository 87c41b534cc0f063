//! Hive - 多 Agent 编排核心
//!
//! 模块划分：
//! - **agent**: Agent 契约与基于语言模型的 LlmAgent
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务模型、拓扑执行器、Agentic 执行器、Agent 选择
//! - **llm**: 语言模型抽象与实现（OpenAI 兼容 / 脚本化 Mock / 重试包装）
//! - **memory**: 记忆条目、存储契约、内存 / SQLite 后端、带副本的 MemoryManager
//! - **observability**: tracing 初始化
//! - **planning**: 分析 / 计划提示词与响应解析
//! - **tools**: 工具契约与注册表

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod planning;
pub mod tools;

pub use agent::{Agent, AgentConfiguration, LlmAgent};
pub use core::{
    AgenticExecutor, AgenticOutcome, ErrorKind, Task, TaskError, TaskResult, TaskStatus, Topology,
    TopologyExecutor,
};
pub use memory::MemoryManager;
