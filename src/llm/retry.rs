//! 带重试的 LLM 包装
//!
//! 按 RetryPolicy 对可重试错误（限流 / 超时）做指数退避重试；不可重试错误立即返回。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::RetryPolicy;
use crate::llm::{Generation, LanguageModel, LlmError};

/// 重试包装器：持有内部模型与重试配置
pub struct RetryingLanguageModel {
    inner: Arc<dyn LanguageModel>,
    policy: RetryPolicy,
}

impl RetryingLanguageModel {
    pub fn new(inner: Arc<dyn LanguageModel>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl LanguageModel for RetryingLanguageModel {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn generate_text(&self, prompt: &str) -> Result<Generation, LlmError> {
        let mut attempt = 1;
        loop {
            match self.inner.generate_text(prompt).await {
                Ok(generation) => return Ok(generation),
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let mut delay = self.policy.delay_for_attempt(attempt);
                    if let LlmError::RateLimited {
                        retry_after_ms: Some(ms),
                    } = &err
                    {
                        delay = delay
                            .max(std::time::Duration::from_millis(*ms))
                            .min(self.policy.max_delay);
                    }
                    tracing::warn!(
                        model = self.inner.model_name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "LLM call failed ({}), retrying",
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLanguageModel;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            2.0,
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_retries_retryable_errors() {
        let inner = Arc::new(
            ScriptedLanguageModel::new("m")
                .with_default("ok")
                .enqueue_error(LlmError::RateLimited { retry_after_ms: Some(1) })
                .enqueue_error(LlmError::Timeout),
        );
        let llm = RetryingLanguageModel::new(inner.clone(), fast_policy(3));
        let generation = llm.generate_text("hi").await.unwrap();
        assert_eq!(generation.text, "ok");
        assert_eq!(inner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let inner = Arc::new(
            ScriptedLanguageModel::new("m")
                .enqueue_error(LlmError::Timeout)
                .enqueue_error(LlmError::Timeout)
                .enqueue_error(LlmError::Timeout),
        );
        let llm = RetryingLanguageModel::new(inner.clone(), fast_policy(2));
        assert_eq!(llm.generate_text("hi").await.unwrap_err(), LlmError::Timeout);
        assert_eq!(inner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let inner = Arc::new(
            ScriptedLanguageModel::new("m")
                .with_default("never")
                .enqueue_error(LlmError::Validation("bad prompt".into())),
        );
        let llm = RetryingLanguageModel::new(inner.clone(), fast_policy(5));
        assert!(matches!(
            llm.generate_text("hi").await,
            Err(LlmError::Validation(_))
        ));
        assert_eq!(inner.call_count(), 1);
    }
}
