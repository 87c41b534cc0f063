//! 编排错误类型
//!
//! ErrorKind 为对外可见的错误分类（写入 TaskResult.error.kind）；
//! TaskError 是失败结果携带的「分类 + 可读信息」，不会越过顶层 execute 抛出。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误分类（序列化为 snake_case，与日志、存储中的 kind 字段一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 无可用 Agent 或最高分为 0
    SelectionFailure,
    /// 达到 max_loops 仍未完成
    LoopExhausted,
    /// 步骤失败且所有 fallback 均失败
    StepFailure,
    TopologyUnsupported,
    /// 主存储与所有 fallback 存储均失败
    StoreUnavailable,
    /// 分析结果解析失败（非致命，降级为空分析）
    AnalysisParseFailure,
    /// 计划解析失败（非致命，该候选不参与选择）
    PlanParseFailure,
    Timeout,
    RateLimit,
    ContentFilter,
    Validation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SelectionFailure => "selection_failure",
            ErrorKind::LoopExhausted => "loop_exhausted",
            ErrorKind::StepFailure => "step_failure",
            ErrorKind::TopologyUnsupported => "topology_unsupported",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::AnalysisParseFailure => "analysis_parse_failure",
            ErrorKind::PlanParseFailure => "plan_parse_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ContentFilter => "content_filter",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        }
    }

    /// 是否属于可重试的远程错误（限流、超时）
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimit | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失败 TaskResult 上的错误：分类 + 人类可读信息
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

/// Task 状态机非法迁移
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("Task {task_id} already bound to executor {executor}")]
    AlreadyBound { task_id: String, executor: String },

    #[error("Task {task_id} is in terminal state {status}")]
    Terminal { task_id: String, status: String },

    #[error("Task {task_id} has no executor bound")]
    Unbound { task_id: String },
}
