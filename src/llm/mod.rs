//! LLM 层：语言模型抽象与实现（OpenAI 兼容 / 脚本化 Mock / 重试包装）

pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use mock::ScriptedLanguageModel;
pub use openai::OpenAiLanguageModel;
pub use retry::RetryingLanguageModel;
pub use traits::{generate_within, Generation, LanguageModel, LlmError};

use crate::config::AppConfig;

/// 根据配置与环境变量选择语言模型；未配置 API Key 时退回脚本化模型
pub fn create_language_model_from_config(cfg: &AppConfig) -> Arc<dyn LanguageModel> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_key = std::env::var("OPENAI_API_KEY").is_ok();

    let base: Arc<dyn LanguageModel> = if provider == "openai" && has_key {
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        Arc::new(OpenAiLanguageModel::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            None,
            Duration::from_secs(cfg.llm.request_timeout_secs),
        ))
    } else {
        tracing::warn!("No API key set or provider is mock, using scripted LLM");
        Arc::new(ScriptedLanguageModel::new("mock").with_default("(mock response)"))
    };

    Arc::new(RetryingLanguageModel::new(base, cfg.retry.to_policy()))
}
