//! 语言模型抽象
//!
//! 所有后端实现 LanguageModel::generate_text：输入完整提示文本（可含分隔标签段落），
//! 返回生成文本与 token 用量。错误区分可重试（限流 / 超时）与不可重试（校验 / 内容过滤）。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{ErrorKind, TaskError, Usage};

/// 一次生成的结果
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

impl Generation {
    pub fn new(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("LLM request timed out")]
    Timeout,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Content filtered: {0}")]
    ContentFilter(String),

    #[error("API error: {0}")]
    ApiError(String),
}

impl LlmError {
    /// 限流与超时可重试，其余直接返回
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::Timeout)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::RateLimited { .. } => ErrorKind::RateLimit,
            LlmError::Timeout => ErrorKind::Timeout,
            LlmError::Validation(_) => ErrorKind::Validation,
            LlmError::ContentFilter(_) => ErrorKind::ContentFilter,
            LlmError::ApiError(_) => ErrorKind::Internal,
        }
    }
}

impl From<LlmError> for TaskError {
    fn from(err: LlmError) -> Self {
        TaskError::new(err.kind(), err.to_string())
    }
}

/// 语言模型 trait
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// 模型名（日志与诊断使用）
    fn model_name(&self) -> &str;

    async fn generate_text(&self, prompt: &str) -> Result<Generation, LlmError>;
}

/// 带时限的生成；超时映射为 LlmError::Timeout
pub async fn generate_within(
    model: &dyn LanguageModel,
    prompt: &str,
    limit: Duration,
) -> Result<Generation, LlmError> {
    tokio::time::timeout(limit, model.generate_text(prompt))
        .await
        .map_err(|_| LlmError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::RateLimited { retry_after_ms: Some(10) }.is_retryable());
        assert!(LlmError::Timeout.is_retryable());
        assert!(!LlmError::Validation("bad".into()).is_retryable());
        assert!(!LlmError::ContentFilter("nope".into()).is_retryable());
        assert!(!LlmError::ApiError("500".into()).is_retryable());
    }

    #[test]
    fn test_llm_error_into_task_error() {
        let err: TaskError = LlmError::ContentFilter("blocked".into()).into();
        assert_eq!(err.kind, ErrorKind::ContentFilter);
        assert!(err.message.contains("blocked"));
    }
}
