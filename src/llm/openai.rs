//! OpenAI 兼容 API 适配器
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。提示文本作为单条 user 消息发送；
//! 请求超时、限流、内容过滤映射为对应的 LlmError，便于上层区分是否重试。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::Usage;
use crate::llm::{Generation, LanguageModel, LlmError};

/// OpenAI 兼容客户端
pub struct OpenAiLanguageModel {
    client: Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
}

impl OpenAiLanguageModel {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        request_timeout: Duration,
    ) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            request_timeout,
        }
    }
}

/// 将底层错误文本归类
fn classify_error(message: String) -> LlmError {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        LlmError::RateLimited {
            retry_after_ms: None,
        }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        LlmError::Timeout
    } else if lower.contains("content_filter") || lower.contains("content filter") {
        LlmError::ContentFilter(message)
    } else if lower.contains("invalid") || lower.contains("400") {
        LlmError::Validation(message)
    } else {
        LlmError::ApiError(message)
    }
}

#[async_trait]
impl LanguageModel for OpenAiLanguageModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_text(&self, prompt: &str) -> Result<Generation, LlmError> {
        let message = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.to_string())
            .build()
            .map_err(|e| LlmError::Validation(e.to_string()))?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![ChatCompletionRequestMessage::User(message)])
            .build()
            .map_err(|e| LlmError::Validation(e.to_string()))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| classify_error(e.to_string()))?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_default();

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(Generation::new(text, usage))
    }
}
